pub mod init;
pub mod linear;
pub mod module;

pub use init::Initializer;
pub use linear::{Linear, LinearGrads};
pub use module::Module;
