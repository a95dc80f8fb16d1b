//! Node trees and the commands that change them.

pub mod command;
pub(crate) mod manipulator;
pub mod node;
pub mod observer;
pub mod revision;
pub mod signal_tree;

pub use command::{ListPosition, SignalCommand};
pub use node::{Alias, Data, Node};
pub use observer::{Observer, ObserverId};
pub use revision::{CommandResult, CommandResults, MutableTreeRevision, NodeModification, TreeRevision};
pub(crate) use signal_tree::TreeCommit;
pub use signal_tree::{
    CleanupCallback, CommandSubmitter, ProcessedCallback, ResultHandler, SignalTree, TreeId,
    TreeKind,
};
