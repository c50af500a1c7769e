//! Client configuration.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::bus::OverflowPolicy;
use crate::request::Command;
use crate::session::SessionStore;

/// Configuration for [`crate::Client::start`] and [`crate::ClientHandle::create`].
#[derive(Clone, Debug)]
pub struct Config {
    pub api_id:                  i32,
    pub api_hash:                String,
    /// Used for the first phone-number attempt instead of asking the provider.
    pub phone:                   Option<String>,
    pub session:                 SessionStore,
    pub database_encryption_key: String,
    pub use_test_dc:             bool,
    pub use_file_database:       bool,
    pub use_chat_info_database:  bool,
    pub use_message_database:    bool,
    pub use_secret_chats:        bool,
    pub system_language_code:    String,
    pub device_model:            String,
    pub system_version:          String,
    pub application_version:     String,
    /// Bounded wait of every receive call; also the shutdown latency.
    pub poll_interval:           Duration,
    /// Default timeout of a submitted request.
    pub request_timeout:         Duration,
    /// How long `destroy` lets the native instance report `Closed`.
    pub close_timeout:           Duration,
    /// Queue bound of each message subscriber.
    pub subscriber_capacity:     usize,
    pub overflow:                OverflowPolicy,
    /// Recent messages kept for late subscribers.
    pub history_len:             usize,
    /// Native log verbosity; `None` leaves the library default.
    pub log_verbosity:           Option<i32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_id:                  0,
            api_hash:                String::new(),
            phone:                   None,
            session:                 SessionStore::default(),
            database_encryption_key: String::new(),
            use_test_dc:             false,
            use_file_database:       true,
            use_chat_info_database:  true,
            use_message_database:    true,
            use_secret_chats:        true,
            system_language_code:    "en".into(),
            device_model:            "headless".into(),
            system_version:          std::env::consts::OS.into(),
            application_version:     env!("CARGO_PKG_VERSION").into(),
            poll_interval:           Duration::from_secs(1),
            request_timeout:         Duration::from_secs(30),
            close_timeout:           Duration::from_secs(5),
            subscriber_capacity:     256,
            overflow:                OverflowPolicy::DropOldest,
            history_len:             100,
            log_verbosity:           Some(1),
        }
    }
}

impl Config {
    /// The `setTdlibParameters` request for this configuration.
    pub fn parameters_command(&self) -> Command {
        Command::new("setTdlibParameters")
            .param("use_test_dc",             self.use_test_dc)
            .param("database_directory",      self.session.database_directory().to_string_lossy())
            .param("files_directory",         self.session.files_directory().to_string_lossy())
            // `bytes` fields travel base64-encoded.
            .param("database_encryption_key", STANDARD.encode(&self.database_encryption_key))
            .param("use_file_database",       self.use_file_database)
            .param("use_chat_info_database",  self.use_chat_info_database)
            .param("use_message_database",    self.use_message_database)
            .param("use_secret_chats",        self.use_secret_chats)
            .param("api_id",                  self.api_id)
            .param("api_hash",                self.api_hash.as_str())
            .param("system_language_code",    self.system_language_code.as_str())
            .param("device_model",            self.device_model.as_str())
            .param("system_version",          self.system_version.as_str())
            .param("application_version",     self.application_version.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn parameters_carry_credentials_and_paths() {
        let config = Config {
            api_id:   123,
            api_hash: "abc".into(),
            session:  SessionStore::new("/tmp/td").with_files_directory("/tmp/files"),
            database_encryption_key: "key".into(),
            ..Default::default()
        };
        let json: Value = serde_json::from_str(&config.parameters_command().encode(Some("r9"))).unwrap();
        assert_eq!(json["@type"], "setTdlibParameters");
        assert_eq!(json["@extra"], "r9");
        assert_eq!(json["api_id"], 123);
        assert_eq!(json["api_hash"], "abc");
        assert_eq!(json["database_directory"], "/tmp/td");
        assert_eq!(json["files_directory"], "/tmp/files");
        assert_eq!(json["database_encryption_key"], "a2V5");
        assert_eq!(json["use_message_database"], true);
    }
}
