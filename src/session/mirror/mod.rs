//! 镜像库（尽力而为的结构化副本，仅用于查询，不提供持久性保证）

mod backend;
mod store;
mod writer;

pub use backend::{DisabledMirror, MirrorBackend, MirrorError, Row, SqlStatement, SqlValue, SqliteMirror};
pub use store::{MirroredEvent, MirroredMessage, MirroredSession, SessionDelta, SessionMirror};
pub use writer::{MirrorOp, MirrorWriter};
