//! # Workspace surface
//!
//! Typed wrappers over the query/command names an editor guest understands.
//! A [`Workspace`] borrows the game together with the adapter it runs
//! against, so each wrapper is a single bridge call.

use serde::Deserialize;
use serde::Serialize;

use crate::fault::ProtocolViolation;
use crate::game::Game;
use crate::game::Result;
use crate::system::System;

pub const WORKSPACE_PNG: &str = "workspacePng";
pub const STATE_VERSION: &str = "stateVersion";
pub const NEXT_IO_REQUEST: &str = "nextIoRequest";
pub const LOAD_WORKSPACE: &str = "loadWorkspace";
pub const IMPORT_IMAGE: &str = "importImage";
pub const NOTIFY_INPUT_NUMBER: &str = "notifyInputNumber";
pub const DISABLE_SAVE_WORKSPACE_BUTTON: &str = "disableSaveWorkspaceButton";

/// Answer to a guest's `inputNumber` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputNumber {
    pub id: u32,
    pub number: String,
}

pub struct Workspace<'a, S: System> {
    game: &'a mut Game<S>,
    system: &'a S,
}

impl<'a, S: System> Workspace<'a, S> {
    pub fn new(game: &'a mut Game<S>, system: &'a S) -> Self {
        Self { game, system }
    }

    /// The whole workspace encoded as PNG.
    pub fn workspace_png(&mut self) -> Result<Vec<u8>> {
        self.game.query(self.system, WORKSPACE_PNG)
    }

    /// Replaces the workspace with a PNG previously produced by
    /// [`Workspace::workspace_png`].
    pub fn load_workspace(&mut self, png: &[u8]) -> Result<()> {
        self.game.command(self.system, LOAD_WORKSPACE, png)
    }

    pub fn import_image(&mut self, png: &[u8]) -> Result<()> {
        self.game.command(self.system, IMPORT_IMAGE, png)
    }

    pub fn notify_input_number(&mut self, input: &InputNumber) -> Result<()> {
        let payload = serde_json::to_vec(input)?;
        self.game.command(self.system, NOTIFY_INPUT_NUMBER, &payload)
    }

    pub fn disable_save_workspace_button(&mut self) -> Result<()> {
        self.game.command(self.system, DISABLE_SAVE_WORKSPACE_BUTTON, &[])
    }

    /// Opaque counter that changes whenever the workspace is modified.
    pub fn state_version(&mut self) -> Result<i64> {
        let bytes = self.game.query(self.system, STATE_VERSION)?;
        let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| ProtocolViolation::LengthMismatch {
            expected: 8,
            actual: bytes.len(),
        })?;
        Ok(i64::from_be_bytes(bytes))
    }

    /// Raw reply of `nextIoRequest`; empty when nothing is pending.
    pub fn next_io_request(&mut self) -> Result<Vec<u8>> {
        self.game.query(self.system, NEXT_IO_REQUEST)
    }
}
