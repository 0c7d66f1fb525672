mod chunker;
mod error;
mod process;
mod properties;
mod pty;
mod session;

pub use chunker::Utf8Chunker;
pub use error::ShellError;
pub use process::PipePtyFactory;
pub use properties::{OsCommandSpec, ShellProperties};
pub use pty::{PtyControl, PtyFactory, PtyPair, PtyRequest};
pub use session::{ShellMode, ShellSession};
