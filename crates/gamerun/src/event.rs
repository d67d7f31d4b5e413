//! # Events
//!
//! Environment and completion events delivered to the guest, one at a time.
//! Events serialize to the guest's JSON envelope; loaded-state data is kept
//! out of the envelope and travels as a separate buffer (see [`Event::into_wire`]).

use serde::Deserialize;
use serde::Serialize;

use crate::action::ActionId;

/// Failure message reported when a state save fails at the platform layer.
pub const PUT_FAILURE: &str = "PUT_FAILURE";
/// Failure message reported when a state load fails at the platform layer.
pub const GET_FAILURE: &str = "GET_FAILURE";
/// Failure message reported when a state delete fails at the platform layer.
pub const DELETE_FAILURE: &str = "DELETE_FAILURE";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Guest-chosen tag attached to a timeout request and echoed on expiry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeoutTag(pub u32);

/// Failure reason carried by a state completion event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Key {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    L,
    M,
    N,
    O,
    P,
    Q,
    R,
    S,
    T,
    U,
    V,
    W,
    X,
    Y,
    Z,
    Num0,
    Num1,
    Num2,
    Num3,
    Num4,
    Num5,
    Num6,
    Num7,
    Num8,
    Num9,
    Up,
    Down,
    Left,
    Right,
    Space,
    Return,
    Backspace,
    Delete,
    Shift,
    Ctrl,
    Alt,
    Tab,
    Escape,
}

impl Key {
    /// Maps a DOM `KeyboardEvent.key` name to a guest key.
    ///
    /// Returns `None` for keys the guest does not understand; callers should
    /// let those propagate to the environment instead of queueing them.
    pub fn from_key_name(name: &str) -> Option<Self> {
        const LETTERS: [Key; 26] = [
            Key::A, Key::B, Key::C, Key::D, Key::E, Key::F, Key::G, Key::H, Key::I,
            Key::J, Key::K, Key::L, Key::M, Key::N, Key::O, Key::P, Key::Q, Key::R,
            Key::S, Key::T, Key::U, Key::V, Key::W, Key::X, Key::Y, Key::Z,
        ];
        const DIGITS: [Key; 10] = [
            Key::Num0, Key::Num1, Key::Num2, Key::Num3, Key::Num4,
            Key::Num5, Key::Num6, Key::Num7, Key::Num8, Key::Num9,
        ];

        let key = match name {
            "ArrowUp" => Key::Up,
            "ArrowDown" => Key::Down,
            "ArrowLeft" => Key::Left,
            "ArrowRight" => Key::Right,
            " " => Key::Space,
            "Enter" => Key::Return,
            "Backspace" => Key::Backspace,
            "Delete" => Key::Delete,
            "Shift" => Key::Shift,
            "Control" => Key::Ctrl,
            "Alt" => Key::Alt,
            "Tab" => Key::Tab,
            "Escape" => Key::Escape,
            _ => {
                let mut chars = name.chars();
                let (Some(c), None) = (chars.next(), chars.next()) else {
                    return None;
                };
                return match c {
                    'a'..='z' => Some(LETTERS[(c as u8 - b'a') as usize]),
                    '0'..='9' => Some(DIGITS[(c as u8 - b'0') as usize]),
                    _ => None,
                };
            }
        };
        Some(key)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl MouseButton {
    /// Maps a DOM `MouseEvent.button` index (0, 1, 2) to a guest button.
    pub fn from_index(index: u16) -> Option<Self> {
        match index {
            0 => Some(Self::Left),
            1 => Some(Self::Middle),
            2 => Some(Self::Right),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowEvent {
    RedrawNeeded { size: Size },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyEvent {
    Up { key: Key },
    Down { key: Key },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MouseEvent {
    Move {
        position: Position,
    },
    Down {
        position: Position,
        button: MouseButton,
    },
    Up {
        position: Position,
        button: MouseButton,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutEvent {
    pub id: ActionId,
    pub tag: TimeoutTag,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateEvent {
    Saved {
        id: ActionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed: Option<Failure>,
    },
    Loaded {
        id: ActionId,
        /// Never part of the envelope; shipped as its own guest buffer.
        #[serde(skip)]
        data: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed: Option<Failure>,
    },
    Deleted {
        id: ActionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed: Option<Failure>,
    },
}

/// An event awaiting delivery to the guest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Event {
    Window(WindowEvent),
    Key(KeyEvent),
    Mouse(MouseEvent),
    Timeout(TimeoutEvent),
    State(StateEvent),
}

/// An event split into its serialized envelope and optional binary payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireEvent {
    pub envelope: Vec<u8>,
    pub data: Option<Vec<u8>>,
}

impl Event {
    pub fn redraw_needed(size: Size) -> Self {
        Event::Window(WindowEvent::RedrawNeeded { size })
    }

    pub fn timeout(id: ActionId, tag: TimeoutTag) -> Self {
        Event::Timeout(TimeoutEvent { id, tag })
    }

    pub fn state_saved(id: ActionId, failed: Option<Failure>) -> Self {
        Event::State(StateEvent::Saved { id, failed })
    }

    pub fn state_loaded(id: ActionId, data: Option<Vec<u8>>, failed: Option<Failure>) -> Self {
        Event::State(StateEvent::Loaded { id, data, failed })
    }

    pub fn state_deleted(id: ActionId, failed: Option<Failure>) -> Self {
        Event::State(StateEvent::Deleted { id, failed })
    }

    /// Returns the correlation id for completion events.
    pub fn action_id(&self) -> Option<ActionId> {
        match self {
            Event::Timeout(TimeoutEvent { id, .. }) => Some(*id),
            Event::State(StateEvent::Saved { id, .. })
            | Event::State(StateEvent::Loaded { id, .. })
            | Event::State(StateEvent::Deleted { id, .. }) => Some(*id),
            _ => None,
        }
    }

    /// Serializes the envelope and detaches any loaded-state payload.
    pub fn into_wire(mut self) -> serde_json::Result<WireEvent> {
        let data = match &mut self {
            Event::State(StateEvent::Loaded { data, .. }) => data.take(),
            _ => None,
        };
        let envelope = serde_json::to_vec(&self)?;
        Ok(WireEvent { envelope, data })
    }
}
