//! Phase executors. Each whole-phase job calls one `run(ctx, run_id)`;
//! phase 2 is driven by the fan-out controller and the post-processing
//! chain instead, using the parsing in [`research`].

pub mod assessment;
pub mod backtest;
pub mod credibility;
pub mod detection;
pub mod domain;
pub mod gate;
pub mod research;
pub mod synthesis;
