pub mod state;

pub use state::{
    AppSettings, DEFAULT_ADAPTER_ID, SETTINGS_DIRECTORY_NAME, SETTINGS_ENV_PREFIX,
    SETTINGS_FILE_NAME, SettingsError, SettingsStore,
};
