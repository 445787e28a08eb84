use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Name of the config file inside the working directory.
pub const CONFIG_FILE: &str = "wisp.conf";

/// Default TCP port for incoming wish connections.
pub const WISH_PORT_DEFAULT: u16 = 37008;

/// Node configuration, read from `wisp.conf` and overridable from the CLI.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// TCP port for incoming wish connections.
    pub port: u16,
    /// TCP port for the loopback app IPC server.
    pub app_port: u16,
    /// Relay servers as `host:port` strings.
    pub relay_hosts: Vec<String>,
    /// Advertise local identities over local discovery.
    pub advertise: bool,
    /// Listen to local discovery broadcasts.
    pub discover: bool,
    /// Accept incoming wish connections.
    pub accept: bool,
    /// Maintain relay control sessions.
    pub relay: bool,
    /// Run the app IPC server.
    pub app_server: bool,
    /// Optional class string announced in discovery broadcasts.
    pub class: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: WISH_PORT_DEFAULT,
            app_port: crate::service::APP_PORT_DEFAULT,
            relay_hosts: Vec::new(),
            advertise: true,
            discover: true,
            accept: true,
            relay: true,
            app_server: true,
            class: None,
        }
    }
}

impl Config {
    /// Loads the config file from the working directory. A missing file
    /// means defaults; a malformed one is a startup error.
    pub fn load(directory: &Path) -> Config {
        let path = directory.join(CONFIG_FILE);

        match fs::File::open(&path) {
            Ok(file) => serde_json::from_reader(file).expect("Error parsing config file"),
            Err(_) => Config::default(),
        }
    }

    /// Persists the configuration, pretty-printed.
    pub fn save(&self, directory: &Path) -> ::std::io::Result<()> {
        let path = directory.join(CONFIG_FILE);
        let contents = serde_json::to_string_pretty(self).expect("Config serialization failed");
        fs::write(path, contents)
    }
}
