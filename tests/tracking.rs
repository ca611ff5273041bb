//! Process-wide tracking configured through `init_with_config`

use typthon_refbase::{
    tracking::RefKind, LifetimePolicy, RefBase, RefConfig, RefCounted, Sp, TrackingConfig,
    TrackingMode,
};

struct Node {
    base: RefBase,
}

unsafe impl RefCounted for Node {
    fn ref_base(&self) -> &RefBase {
        &self.base
    }
}

fn node() -> Sp<Node> {
    Sp::new(Node {
        base: RefBase::with_policy(LifetimePolicy::WeakExtendsLife),
    })
}

#[test]
fn test_track_all_installs_trackers() {
    let config = RefConfig {
        tracking: TrackingConfig {
            track_all: true,
            retain: false,
            holder_ids: true,
        },
        ..RefConfig::default()
    };
    typthon_refbase::init_with_config(config);

    let a = node();
    let b = a.clone();
    let w = Sp::downgrade(&b);

    let report = Sp::print_refs(&a);
    assert_eq!(report.mode, Some(TrackingMode::OutstandingOnly));
    assert_eq!(report.outstanding(RefKind::Strong).count(), 2);
    assert_eq!(report.outstanding(RefKind::Weak).count(), 3);
    assert!(report.entries.iter().all(|e| !e.holder.is_anonymous()));

    drop(b);
    let report = w.print_refs();
    let holders: Vec<_> = report.outstanding(RefKind::Strong).map(|e| e.holder).collect();
    assert_eq!(holders, vec![Sp::holder(&a)]);

    let json = report.to_json().unwrap();
    assert!(json.contains("\"policy\": \"weak_extends_life\""));
    assert!(report.to_string().contains("strong references: 1"));
}
