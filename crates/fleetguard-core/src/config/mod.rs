mod settings;

pub use settings::{
    CircuitSettings, Command, Config, Settings, StoreBackend, StoreSettings, Threshold,
    UsageSettings, WebSettings, ENV_DB_PATH, ENV_FLUSH_INTERVAL_MS, ENV_FLUSH_TIMEOUT_MS,
    ENV_MAX_BATCH_SIZE, ENV_PORT,
};
