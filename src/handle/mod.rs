//! RAII handles over managed objects
//!
//! - `Sp<T>`: strong, owning; derefs to `T`
//! - `Wp<T>`: weak, observing; `promote` to get an `Sp<T>` back
//!
//! Both compare by object address across types, so an `Sp<T>` and a
//! `Wp<U>` pointing at the same object are equal. Two weak handles also
//! compare their blocks, which tells a stale handle from a fresh one on a
//! recycled address.

mod strong;
mod weak;


pub use strong::Sp;
pub use weak::Wp;
