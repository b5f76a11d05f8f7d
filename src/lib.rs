pub mod artifacts;
pub mod bootstrap;
pub mod commands;
pub mod config;
pub mod context;
pub mod cv;
pub mod dataset;
pub mod drift;
pub mod error;
pub mod estimator;
pub mod evaluation;
pub mod features;
pub mod meta;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod oof;
pub mod param_utils;
pub mod progress;
pub mod regressor;
pub mod router;
pub mod scaler;
pub mod search;
pub mod specialist;
pub mod training;
pub mod weighting;
