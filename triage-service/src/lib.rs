pub mod clients;
pub mod config;
pub mod delivery;
pub mod department;
pub mod fallback;
pub mod intake;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod report_parser;
pub mod service;
pub mod tasks;
pub mod wire;

pub use config::ServiceConfig;
pub use delivery::WorkerPool;
pub use department::DepartmentValidator;
pub use models::{AnalysisOutcome, AnalysisRequest, KeyInfo, StreamFragment};
pub use pipeline::{Pipeline, Services};
pub use service::{AppState, build_router};
pub use wire::{AnalysisReport, AnalysisStatus, ResponseFrame};
