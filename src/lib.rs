pub mod capa;
pub mod config;
pub mod controllers;
pub mod error;
pub mod finalizer;
pub mod guard;
pub mod iam;
pub mod irsa;
pub mod key;
pub mod policy;
pub mod tags;

pub use config::OperatorConfig;
pub use error::{Error, ErrorKind, IamError, Result};
