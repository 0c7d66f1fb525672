use serde::Deserialize;

use crate::error::ShellError;

/// Per-OS command configuration carried in the session properties.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OsCommandSpec {
    #[serde(default)]
    pub commands: String,
    #[serde(default)]
    pub run_as_elevated: bool,
    #[serde(default)]
    pub separate_output_stream: bool,
    #[serde(default)]
    pub stdout_separator_prefix: String,
    #[serde(default)]
    pub stderr_separator_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ShellProperties {
    #[serde(rename = "Linux")]
    pub linux: Option<OsCommandSpec>,
    #[serde(rename = "Windows")]
    pub windows: Option<OsCommandSpec>,
    #[serde(rename = "MacOS")]
    pub mac_os: Option<OsCommandSpec>,
}

impl ShellProperties {
    pub fn parse(properties: &serde_json::Value) -> Result<Self, ShellError> {
        if properties.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(properties.clone())?)
    }

    pub fn for_current_platform(&self) -> Option<&OsCommandSpec> {
        #[cfg(target_os = "macos")]
        return self.mac_os.as_ref();
        #[cfg(target_os = "windows")]
        return self.windows.as_ref();
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        return self.linux.as_ref();
    }
}
