//! Host runtime for sandboxed WebAssembly games and editors.
//!
//! A guest module runs inside wasmtime and talks to the host through a
//! narrow call surface. Host capabilities (video, audio, clocks, timers,
//! persistent state) are reached through `env` imports; anything the guest
//! treats as asynchronous completes later as an event on a single ordered
//! queue that the [`driver::Driver`] feeds back to the guest.

pub mod action;
pub mod config;
pub mod context;
pub mod driver;
pub mod event;
pub mod fault;
pub mod game;
pub mod linker;
pub mod memory;
pub mod queue;
pub mod system;
pub mod workspace;

pub use action::ActionId;
pub use config::GameConfig;
pub use driver::Driver;
pub use driver::IoHandler;
pub use driver::IoRequest;
pub use event::Event;
pub use game::Game;
pub use system::HostSystem;
pub use system::System;
pub use workspace::Workspace;
