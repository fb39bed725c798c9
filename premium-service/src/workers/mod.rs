mod sweep;

pub use sweep::{ReconciliationSweep, SweepReport, ABANDONED};
