//! Value types reported to the surrounding application.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::Role;

/// Access-dialog choice bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChoiceFlags(i64);

impl ChoiceFlags {
    pub const NONE: ChoiceFlags = ChoiceFlags(0);
    pub const YES: ChoiceFlags = ChoiceFlags(1);
    pub const NO: ChoiceFlags = ChoiceFlags(2);
    pub const ALWAYS: ChoiceFlags = ChoiceFlags(4);
    pub const NEVER: ChoiceFlags = ChoiceFlags(8);

    /// Answer used when the user did not respond in time.
    pub const DEFAULT_DENY: ChoiceFlags = ChoiceFlags::NO;

    pub const fn from_bits(bits: i64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> i64 {
        self.0
    }

    pub const fn contains(self, other: ChoiceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the choice grants access, now or permanently.
    pub const fn is_granted(self) -> bool {
        self.contains(ChoiceFlags::YES) || self.contains(ChoiceFlags::ALWAYS)
    }
}

impl BitOr for ChoiceFlags {
    type Output = ChoiceFlags;

    fn bitor(self, rhs: Self) -> Self {
        ChoiceFlags(self.0 | rhs.0)
    }
}

/// Bitmask of running slaves, one bit per role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlaveStates(u32);

impl SlaveStates {
    pub const ACCESS_DIALOG_RUNNING: SlaveStates = SlaveStates(1);
    pub const DEMO_SERVER_RUNNING: SlaveStates = SlaveStates(2);
    pub const DEMO_CLIENT_RUNNING: SlaveStates = SlaveStates(4);
    pub const SCREEN_LOCK_RUNNING: SlaveStates = SlaveStates(8);
    pub const INPUT_LOCK_RUNNING: SlaveStates = SlaveStates(16);

    /// Roles that are reported, in bit order.
    pub const REPORTED: [Role; 5] = [
        Role::AccessDialog,
        Role::DemoServer,
        Role::DemoClient,
        Role::ScreenLock,
        Role::InputLock,
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Bit for `role`; `CoreServer` has none.
    pub const fn for_role(role: Role) -> SlaveStates {
        match role {
            Role::AccessDialog => Self::ACCESS_DIALOG_RUNNING,
            Role::DemoServer => Self::DEMO_SERVER_RUNNING,
            Role::DemoClient => Self::DEMO_CLIENT_RUNNING,
            Role::ScreenLock => Self::SCREEN_LOCK_RUNNING,
            Role::InputLock => Self::INPUT_LOCK_RUNNING,
            Role::CoreServer => Self::empty(),
        }
    }

    pub const fn contains(self, other: SlaveStates) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_running(self, role: Role) -> bool {
        let bit = Self::for_role(role);
        bit.0 != 0 && self.contains(bit)
    }
}

impl BitOr for SlaveStates {
    type Output = SlaveStates;

    fn bitor(self, rhs: Self) -> Self {
        SlaveStates(self.0 | rhs.0)
    }
}

impl BitOrAssign for SlaveStates {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl FromIterator<Role> for SlaveStates {
    fn from_iter<I: IntoIterator<Item = Role>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SlaveStates::empty(), |acc, role| acc | SlaveStates::for_role(role))
    }
}

impl fmt::Display for SlaveStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::REPORTED
            .iter()
            .filter(|r| self.is_running(**r))
            .map(|r| r.as_str())
            .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}
