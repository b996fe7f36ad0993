pub mod download;
pub mod error;
pub mod gate;
pub mod logsink;
pub mod resolver;
pub mod session;
pub mod translator;

pub use download::{DownloadConfig, DownloadEngine, DownloadError};
pub use error::UplinkError;
pub use gate::{PromptAnswer, ResponseGate};
pub use logsink::LogSink;
pub use resolver::{
    DependencyError, DependencyResolver, ResolverConfig, current_target, default_specs,
    env_var_name,
};
pub use session::{BASE_DIR_ENV, SessionCreateOptions, SessionManager, SessionManagerConfig};
pub use translator::{Classified, PromptTranslator};
