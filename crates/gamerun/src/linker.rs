//! # Capability linking
//!
//! Installs the guest's `env` imports. Each import decodes its raw arguments
//! (offsets and lengths into guest memory) and forwards to the platform
//! adapter active for the current bridge call.
//!
//! Import module `env`:
//! ```wat
//! (import "env" "systemVideoInit" (func (param i32 i32 i32 i32)))
//! (import "env" "systemClockSetTimeout" (func (param i32 f64) (result i64)))
//! ```
//!
//! Any [`ProtocolViolation`] raised here traps the guest; the bridge
//! recovers the violation from the trap.

use wasmtime::Caller;
use wasmtime::Extern;
use wasmtime::Linker;
use wasmtime::Memory;

use crate::context::GameCtx;
use crate::event::Size;
use crate::event::TimeoutTag;
use crate::fault::ProtocolViolation;
use crate::memory::region;
use crate::memory::write_region;
use crate::system::System;
use crate::system::VideoFrame;
use crate::system::timer::delay_from_secs;

const MODULE: &str = "env";

/// Registers every capability import on `linker`.
pub fn link<S: System>(linker: &mut Linker<GameCtx<S>>) -> wasmtime::Result<()> {
    link_video(linker)?;
    link_audio(linker)?;
    link_console(linker)?;
    link_clock(linker)?;
    link_state(linker)?;
    Ok(())
}

fn link_video<S: System>(linker: &mut Linker<GameCtx<S>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        MODULE,
        "systemVideoInit",
        |mut caller: Caller<'_, GameCtx<S>>, width: u32, height: u32, format_ptr: u32, stride_ptr: u32| -> wasmtime::Result<_> {
            let system = active_system(&caller)?;
            let memory = guest_memory(&mut caller)?;
            let spec = system.video_init(Size::new(width, height));
            write_region(&memory, &mut caller, format_ptr, &[spec.pixel_format as u8]).map_err(trap)?;
            write_region(&memory, &mut caller, stride_ptr, &spec.stride.to_le_bytes()).map_err(trap)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        MODULE,
        "systemVideoDraw",
        |mut caller: Caller<'_, GameCtx<S>>, offset: u32, len: u32, width: u32, stride: u32, format: u32| -> wasmtime::Result<_> {
            let system = active_system(&caller)?;
            let memory = guest_memory(&mut caller)?;
            let data = region(&memory, &caller, offset, len).map_err(trap)?;
            let frame = VideoFrame::new(data, width, stride, format).map_err(trap)?;
            system.video_draw(frame);
            Ok(())
        },
    )?;
    Ok(())
}

fn link_audio<S: System>(linker: &mut Linker<GameCtx<S>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        MODULE,
        "systemAudioInit",
        |mut caller: Caller<'_, GameCtx<S>>, sample_rate: u32, data_samples: u32, format_ptr: u32| -> wasmtime::Result<_> {
            let system = active_system(&caller)?;
            let memory = guest_memory(&mut caller)?;
            let format = system.audio_init(sample_rate, data_samples as usize);
            write_region(&memory, &mut caller, format_ptr, &[format as u8]).map_err(trap)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        MODULE,
        "systemAudioEnqueue",
        |mut caller: Caller<'_, GameCtx<S>>, offset: u32, len: u32| -> wasmtime::Result<_> {
            let system = active_system(&caller)?;
            let memory = guest_memory(&mut caller)?;
            let data = region(&memory, &caller, offset, len).map_err(trap)?;
            system.audio_enqueue(data);
            Ok(())
        },
    )?;
    Ok(())
}

fn link_console<S: System>(linker: &mut Linker<GameCtx<S>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        MODULE,
        "systemConsoleLog",
        |mut caller: Caller<'_, GameCtx<S>>, offset: u32, len: u32| -> wasmtime::Result<_> {
            let system = active_system(&caller)?;
            let memory = guest_memory(&mut caller)?;
            let bytes = region(&memory, &caller, offset, len).map_err(trap)?;
            system.console_log(&String::from_utf8_lossy(bytes));
            Ok(())
        },
    )?;
    Ok(())
}

fn link_clock<S: System>(linker: &mut Linker<GameCtx<S>>) -> wasmtime::Result<()> {
    linker.func_wrap(MODULE, "systemClockGameTime", |caller: Caller<'_, GameCtx<S>>| -> wasmtime::Result<_> {
        Ok(active_system(&caller)?.clock_game_time().as_secs_f64())
    })?;

    linker.func_wrap(MODULE, "systemClockUnixTime", |caller: Caller<'_, GameCtx<S>>| -> wasmtime::Result<_> {
        Ok(active_system(&caller)?.clock_unix_time().as_secs_f64())
    })?;

    linker.func_wrap(
        MODULE,
        "systemClockSetTimeout",
        |caller: Caller<'_, GameCtx<S>>, tag: u32, seconds: f64| -> wasmtime::Result<_> {
            let system = active_system(&caller)?;
            Ok(system.clock_set_timeout(TimeoutTag(tag), delay_from_secs(seconds)).get())
        },
    )?;
    Ok(())
}

fn link_state<S: System>(linker: &mut Linker<GameCtx<S>>) -> wasmtime::Result<()> {
    linker.func_wrap(
        MODULE,
        "systemStateSave",
        |mut caller: Caller<'_, GameCtx<S>>, name_offset: u32, name_len: u32, data_offset: u32, data_len: u32| -> wasmtime::Result<_> {
            let system = active_system(&caller)?;
            let memory = guest_memory(&mut caller)?;
            let name = region(&memory, &caller, name_offset, name_len).map_err(trap)?;
            let data = region(&memory, &caller, data_offset, data_len).map_err(trap)?;
            Ok(system.state_save(&String::from_utf8_lossy(name), data).get())
        },
    )?;

    linker.func_wrap(
        MODULE,
        "systemStateLoad",
        |mut caller: Caller<'_, GameCtx<S>>, name_offset: u32, name_len: u32| -> wasmtime::Result<_> {
            let system = active_system(&caller)?;
            let memory = guest_memory(&mut caller)?;
            let name = region(&memory, &caller, name_offset, name_len).map_err(trap)?;
            Ok(system.state_load(&String::from_utf8_lossy(name)).get())
        },
    )?;

    linker.func_wrap(
        MODULE,
        "systemStateDelete",
        |mut caller: Caller<'_, GameCtx<S>>, name_offset: u32, name_len: u32| -> wasmtime::Result<_> {
            let system = active_system(&caller)?;
            let memory = guest_memory(&mut caller)?;
            let name = region(&memory, &caller, name_offset, name_len).map_err(trap)?;
            Ok(system.state_delete(&String::from_utf8_lossy(name)).get())
        },
    )?;
    Ok(())
}

fn active_system<S: System>(caller: &Caller<'_, GameCtx<S>>) -> wasmtime::Result<S> {
    caller.data().system().map_err(trap)
}

fn guest_memory<S: System>(caller: &mut Caller<'_, GameCtx<S>>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("guest does not export 'memory'"))
}

/// Turns a violation into a trap the bridge can recover it from.
fn trap(violation: ProtocolViolation) -> wasmtime::Error {
    tracing::error!(%violation, "capability call rejected");
    wasmtime::Error::new(violation)
}
