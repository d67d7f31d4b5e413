//! # Guest Bridge
//!
//! Owns one instantiated guest and exposes its call surface: `initialize`,
//! `handle_event`, `query` and `command`.
//!
//! Every call follows the same frame:
//! 1. install the platform adapter in the store context ([`SystemScope`]),
//! 2. copy inputs into freshly allocated guest buffers,
//! 3. call the export,
//! 4. free the inputs, take (read and free) the result buffer if any,
//! 5. clear the adapter, whatever happened in between.
//!
//! A trap leaves the guest in an unknown state, so the game becomes
//! terminal: every later call fails with [`Error::Terminated`]. The same
//! holds for a failed `initialize` and for protocol violations.

use std::ops::Deref;
use std::ops::DerefMut;
use std::path::Path;

use wasmtime::Engine;
use wasmtime::Linker;
use wasmtime::Module;
use wasmtime::Store;
use wasmtime::TypedFunc;

use crate::config::GameConfig;
use crate::context::GameCtx;
use crate::event::Event;
use crate::fault::GuestFault;
use crate::fault::ProtocolViolation;
use crate::memory;
use crate::memory::BufferStats;
use crate::memory::GuestBuffer;
use crate::memory::Marshaler;
use crate::system::System;

#[derive(Debug)]
pub enum Error {
    /// The guest reported an error of its own.
    Fault(GuestFault),
    Protocol(ProtocolViolation),
    Trap(wasmtime::Error),
    /// Compiling, linking or instantiating the module failed.
    Module(wasmtime::Error),
    Encode(serde_json::Error),
    /// The game failed earlier and accepts no more calls.
    Terminated,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fault(e) => write!(f, "{}", e),
            Self::Protocol(v) => write!(f, "Protocol violation: {}", v),
            Self::Trap(e) => write!(f, "Guest trapped: {}", e),
            Self::Module(e) => write!(f, "Module error: {}", e),
            Self::Encode(e) => write!(f, "Event encoding failed: {}", e),
            Self::Terminated => write!(f, "Game terminated by an earlier failure"),
        }
    }
}

impl std::error::Error for Error {}

impl From<GuestFault> for Error {
    fn from(e: GuestFault) -> Self {
        Self::Fault(e)
    }
}

impl From<ProtocolViolation> for Error {
    fn from(v: ProtocolViolation) -> Self {
        Self::Protocol(v)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e)
    }
}

impl From<memory::Error> for Error {
    fn from(e: memory::Error) -> Self {
        match e {
            memory::Error::Violation(v) => Self::Protocol(v),
            memory::Error::Guest(e) => Self::trap(e),
        }
    }
}

impl Error {
    /// Classifies an error raised while the guest was running. Violations
    /// detected by a capability travel inside the trap and are recovered here.
    fn trap(e: wasmtime::Error) -> Self {
        match e.downcast_ref::<ProtocolViolation>() {
            Some(v) => Self::Protocol(v.clone()),
            None => Self::Trap(e),
        }
    }

    /// Whether the guest can no longer be trusted after this error.
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Trap(_) | Self::Terminated)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Result bytes by which the guest asks to be shut down.
const SHUTDOWN_SENTINEL: &[u8] = b"null";

fn is_shutdown_request(bytes: &[u8]) -> bool {
    bytes.trim_ascii() == SHUTDOWN_SENTINEL
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Status {
    Loaded,
    Ready,
    Terminated,
}

struct Exports {
    initialize: TypedFunc<u32, u32>,
    handle_event: TypedFunc<(u32, u32, u32), u32>,
    query: TypedFunc<(u32, u32), u32>,
    command: TypedFunc<(u32, u32, u32), u32>,
}

/// Installs the adapter for the duration of one bridge call.
///
/// Holding `&mut Store` for its whole lifetime rules out a second,
/// overlapping call on the same store.
struct SystemScope<'a, S: System> {
    store: &'a mut Store<GameCtx<S>>,
}

impl<'a, S: System> SystemScope<'a, S> {
    fn enter(store: &'a mut Store<GameCtx<S>>, system: &S) -> Self {
        store.data_mut().install(system.clone());
        Self { store }
    }
}

impl<S: System> Deref for SystemScope<'_, S> {
    type Target = Store<GameCtx<S>>;

    fn deref(&self) -> &Self::Target {
        self.store
    }
}

impl<S: System> DerefMut for SystemScope<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.store
    }
}

impl<S: System> Drop for SystemScope<'_, S> {
    fn drop(&mut self) {
        self.store.data_mut().clear();
    }
}

/// One instantiated guest.
pub struct Game<S: System> {
    store: Store<GameCtx<S>>,
    marshaler: Marshaler,
    exports: Exports,
    handle: u32,
    status: Status,
}

impl<S: System> Game<S> {
    /// Links the capability surface, instantiates `module` and creates the
    /// guest's game value.
    pub fn load(engine: &Engine, module: &Module, config: &GameConfig) -> Result<Self> {
        let mut linker = Linker::new(engine);
        crate::linker::link(&mut linker).map_err(Error::Module)?;

        let mut store = Store::new(engine, GameCtx::new(config.max_memory));
        store.limiter(|ctx| &mut ctx.limits);

        let instance = linker.instantiate(&mut store, module).map_err(Error::Module)?;
        let marshaler = Marshaler::new(&mut store, &instance).map_err(Error::Module)?;
        let exports = Exports {
            initialize: instance.get_typed_func(&mut store, "gameInitialize").map_err(Error::Module)?,
            handle_event: instance.get_typed_func(&mut store, "gameHandleEvent").map_err(Error::Module)?,
            query: instance.get_typed_func(&mut store, "gameQuery").map_err(Error::Module)?,
            command: instance.get_typed_func(&mut store, "gameCommand").map_err(Error::Module)?,
        };
        let game_new: TypedFunc<(), u32> = instance.get_typed_func(&mut store, "gameNew").map_err(Error::Module)?;
        let handle = game_new.call(&mut store, ()).map_err(Error::trap)?;
        tracing::debug!(handle, "guest instantiated");

        Ok(Self {
            store,
            marshaler,
            exports,
            handle,
            status: Status::Loaded,
        })
    }

    /// Compiles a module (binary or text format) and loads it.
    pub fn from_bytes(engine: &Engine, bytes: &[u8], config: &GameConfig) -> Result<Self> {
        let module = Module::new(engine, bytes).map_err(Error::Module)?;
        Self::load(engine, &module, config)
    }

    pub fn from_file(engine: &Engine, path: impl AsRef<Path>, config: &GameConfig) -> Result<Self> {
        let module = Module::from_file(engine, path).map_err(Error::Module)?;
        Self::load(engine, &module, config)
    }

    /// Buffer bookkeeping across every call made so far.
    pub fn buffer_stats(&self) -> BufferStats {
        self.marshaler.stats()
    }

    pub fn is_terminated(&self) -> bool {
        self.status == Status::Terminated
    }

    /// Runs the guest's one-time initialization. A failure here is final.
    pub fn initialize(&mut self, system: &S) -> Result<()> {
        match self.status {
            Status::Loaded => {}
            Status::Ready => return Err(ProtocolViolation::AlreadyInitialized.into()),
            Status::Terminated => return Err(Error::Terminated),
        }
        let result = self.call(system, |store, marshaler, exports, handle| {
            let code = exports.initialize.call(&mut **store, handle).map_err(Error::trap)?;
            if code == 0 {
                return Ok(());
            }
            let message = marshaler.take(&mut **store, code)?;
            Err(GuestFault::from_bytes(&message).into())
        });
        match &result {
            Ok(()) => self.status = Status::Ready,
            Err(e) => {
                tracing::error!(error = %e, "guest initialization failed");
                self.status = Status::Terminated;
            }
        }
        result
    }

    /// Delivers one event. Returns `Ok(false)` when the guest asks to shut
    /// down.
    ///
    /// Events are only accepted once `initialize` has succeeded; queries and
    /// commands may be issued before that.
    pub fn handle_event(&mut self, system: &S, event: Event) -> Result<bool> {
        if self.status == Status::Loaded {
            return Err(ProtocolViolation::NotInitialized.into());
        }
        let wire = event.into_wire()?;
        self.call(system, |store, marshaler, exports, handle| {
            let envelope = marshaler.create(&mut **store, &wire.envelope)?;
            let data = match wire.data.as_deref().map(|data| marshaler.create(&mut **store, data)) {
                None => None,
                Some(Ok(buffer)) => Some(buffer),
                Some(Err(e)) => {
                    release(marshaler, store, envelope);
                    return Err(e.into());
                }
            };

            let args = (handle, envelope.handle(), data.as_ref().map_or(0, GuestBuffer::handle));
            let code = exports.handle_event.call(&mut **store, args);
            release(marshaler, store, envelope);
            if let Some(data) = data {
                release(marshaler, store, data);
            }

            let code = code.map_err(Error::trap)?;
            if code == 0 {
                return Ok(true);
            }
            let result = marshaler.take(&mut **store, code)?;
            if is_shutdown_request(&result) {
                tracing::info!("guest requested shutdown");
                return Ok(false);
            }
            Err(GuestFault::from_bytes(&result).into())
        })
    }

    /// Asks the guest for a named value.
    ///
    /// The guest's reply ends with a status byte: zero means the preceding
    /// bytes are the value, anything else means they are an error message.
    pub fn query(&mut self, system: &S, name: &str) -> Result<Vec<u8>> {
        self.call(system, |store, marshaler, exports, handle| {
            let name = marshaler.create(&mut **store, name.as_bytes())?;
            let code = exports.query.call(&mut **store, (handle, name.handle()));
            release(marshaler, store, name);

            let code = code.map_err(Error::trap)?;
            let mut result = marshaler.take(&mut **store, code)?;
            match result.pop() {
                None => Err(ProtocolViolation::MissingStatusTag.into()),
                Some(0) => Ok(result),
                Some(_) => Err(GuestFault::from_bytes(&result).into()),
            }
        })
    }

    /// Sends a named command with a payload.
    pub fn command(&mut self, system: &S, name: &str, payload: &[u8]) -> Result<()> {
        self.call(system, |store, marshaler, exports, handle| {
            let name = marshaler.create(&mut **store, name.as_bytes())?;
            let data = match marshaler.create(&mut **store, payload) {
                Ok(data) => data,
                Err(e) => {
                    release(marshaler, store, name);
                    return Err(e.into());
                }
            };

            let code = exports.command.call(&mut **store, (handle, name.handle(), data.handle()));
            release(marshaler, store, name);
            release(marshaler, store, data);

            let code = code.map_err(Error::trap)?;
            if code == 0 {
                return Ok(());
            }
            let message = marshaler.take(&mut **store, code)?;
            Err(GuestFault::from_bytes(&message).into())
        })
    }

    fn call<R>(
        &mut self,
        system: &S,
        f: impl FnOnce(&mut SystemScope<'_, S>, &mut Marshaler, &Exports, u32) -> Result<R>,
    ) -> Result<R> {
        if self.status == Status::Terminated {
            return Err(Error::Terminated);
        }
        let Self {
            store,
            marshaler,
            exports,
            handle,
            status,
        } = self;

        let mut scope = SystemScope::enter(store, system);
        let result = f(&mut scope, marshaler, exports, *handle);
        drop(scope);

        if let Err(e) = &result {
            if e.is_terminal() {
                tracing::error!(error = %e, "guest call failed; game terminated");
                *status = Status::Terminated;
            } else {
                tracing::debug!(error = %e, "guest call failed");
            }
        }
        result
    }
}

/// Frees an input buffer after the guest returned. A failure is logged and
/// otherwise ignored; the call's own outcome takes precedence.
fn release<S: System>(marshaler: &mut Marshaler, store: &mut SystemScope<'_, S>, buffer: GuestBuffer) {
    let handle = buffer.handle();
    if let Err(e) = marshaler.free(&mut **store, buffer) {
        tracing::error!(handle, error = %e, "failed to release input buffer");
    }
}
