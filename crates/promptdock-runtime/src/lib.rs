//! Runtime supervision control-plane for LLM-generated web programs.
//!
//! A prompt goes in; the supervisor asks the language model for a program,
//! validates it, runs it in the sandbox, discovers the port it bound from a
//! `PORT=<n>` log beacon, wires a reverse-proxy route, and health-checks the
//! result, racing several candidates and rebuilding failures under a bounded
//! retry budget.

pub mod config;
pub mod error;
pub mod launcher;
pub mod llm;
pub mod models;
pub mod rebuild;
pub mod registry;
pub mod routes;
pub mod scanner;
pub mod store;
pub mod supervisor;
pub mod validator;

pub use config::{Config, ConfigError};
pub use error::RuntimeError;
pub use llm::{
    extract_code, initial_prompt, rebuild_prompt, title_prompt, ChatCompletionsClient,
    LanguageModel, LlmError,
};
pub use models::{Runtime, RuntimeState};
pub use registry::RuntimeRegistry;
pub use routes::RouteTable;
pub use scanner::extract_port;
pub use store::{RecordStore, StoreError};
pub use supervisor::{Supervisor, SupervisorTimings};
pub use validator::{ProgramValidator, ValidationError};
