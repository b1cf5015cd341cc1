//! Live literate-document renderer.
//!
//! `weave` watches a markdown source file, executes its fenced code cells on
//! a persistent Jupyter kernel, and keeps an HTML report in sync, live over
//! websockets or once in batch mode. Cell state and rendering live in the
//! `weave-doc` crate; this crate owns the kernel transport, the event loop,
//! the HTTP server, and the file watcher.

pub mod batch;
pub mod coordinator;
pub mod kernel;
pub mod protocol;
pub mod server;
pub mod source;
