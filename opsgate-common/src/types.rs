use std::fmt::Debug;

use serde::{Deserialize, Serialize};

pub type SessionId = String;

/// Exit code a session reports when it completed normally.
pub const EXIT_CODE_SUCCESS: i32 = 0;
/// Exit code a session reports when it failed.
pub const EXIT_CODE_FAILURE: i32 = 1;
/// Pass-through exit code: the command requested a reboot (POSIX).
pub const EXIT_CODE_REBOOT_POSIX: i32 = 194;
/// Pass-through exit code: the command requested a reboot (Windows).
pub const EXIT_CODE_REBOOT_WINDOWS: i32 = 3010;
/// Pass-through exit code: the command was stopped preemptively.
pub const EXIT_CODE_PREEMPTIVE_STOP: i32 = 137;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    Publish,
    Subscribe,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Publish => "publish",
            ChannelRole::Subscribe => "subscribe",
        }
    }
}

#[derive(PartialEq, Clone)]
pub struct Secret<T>(T);

impl<T> Secret<T> {
    pub const fn new(v: T) -> Self {
        Self(v)
    }

    pub fn expose_secret(&self) -> &T {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for Secret<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = Deserialize::deserialize::<D>(deserializer)?;
        Ok(Self::new(v))
    }
}

impl<T> Serialize for Secret<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Debug for Secret<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<secret>")
    }
}
