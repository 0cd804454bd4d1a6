pub mod lifecycle;
pub mod reconcile;
