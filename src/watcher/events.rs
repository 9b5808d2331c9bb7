//! Raw watch events as seen by the watch engine.

use std::{
    ffi::OsString,
    fmt::{Debug, Formatter, Result as FmtResult},
    ops::{BitOr, BitOrAssign},
};

/// OS watch descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub i32);

impl WatchHandle {
    /// Parent of the filesystem root.
    pub const ROOT_PARENT: Self = Self(-1);
    /// Parent not (yet) known.
    pub const UNKNOWN_PARENT: Self = Self(-2);

    /// Returns `true` for real descriptors, `false` for the sentinels.
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

/// Set of event bits, with inotify semantics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const CLOSE_WRITE: Self = Self(0x0000_0008);
    pub const MOVED_FROM: Self = Self(0x0000_0040);
    pub const MOVED_TO: Self = Self(0x0000_0080);
    pub const CREATE: Self = Self(0x0000_0100);
    pub const DELETE: Self = Self(0x0000_0200);
    pub const DELETE_SELF: Self = Self(0x0000_0400);
    pub const MOVE_SELF: Self = Self(0x0000_0800);
    pub const UNMOUNT: Self = Self(0x0000_2000);
    pub const IGNORED: Self = Self(0x0000_8000);
    pub const ISDIR: Self = Self(0x4000_0000);

    /// Events about the watched directory itself rather than an entry in it.
    pub const SELF_EVENTS: Self = Self(Self::DELETE_SELF.0 | Self::MOVE_SELF.0 | Self::UNMOUNT.0);
    /// Events that make an entry appear.
    pub const ADDITIONS: Self = Self(Self::CLOSE_WRITE.0 | Self::MOVED_TO.0 | Self::CREATE.0);
    /// Events that make an entry disappear.
    pub const REMOVALS: Self =
        Self(Self::DELETE.0 | Self::MOVED_FROM.0 | Self::SELF_EVENTS.0);

    const NAMES: [(Self, &'static str); 10] = [
        (Self::CLOSE_WRITE, "CLOSE_WRITE"),
        (Self::MOVED_FROM, "MOVED_FROM"),
        (Self::MOVED_TO, "MOVED_TO"),
        (Self::CREATE, "CREATE"),
        (Self::DELETE, "DELETE"),
        (Self::DELETE_SELF, "DELETE_SELF"),
        (Self::MOVE_SELF, "MOVE_SELF"),
        (Self::UNMOUNT, "UNMOUNT"),
        (Self::IGNORED, "IGNORED"),
        (Self::ISDIR, "ISDIR"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Keeps the bits of a kernel mask the engine knows about.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        let mut known = 0;
        let mut i = 0;
        while i < Self::NAMES.len() {
            known |= Self::NAMES[i].0.0;
            i += 1;
        }
        Self(bits & known)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if any bit of `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Debug for EventMask {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "EventMask({:#x})", self.0)
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// One event on a watched directory.
///
/// `name` is the affected entry, empty for events about the directory
/// itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub handle: WatchHandle,
    pub mask: EventMask,
    pub name: OsString,
}

impl RawEvent {
    pub fn new(handle: WatchHandle, mask: EventMask, name: impl Into<OsString>) -> Self {
        Self {
            handle,
            mask,
            name: name.into(),
        }
    }
}

/// Messages consumed by the watch engine thread.
#[derive(Debug, Clone)]
pub enum EngineMessage {
    Event(RawEvent),
    /// New monitor or unmonitor requests are queued.
    Wake,
    /// Check start points and waiting roots against the filesystem.
    Recheck,
    Shutdown,
}
