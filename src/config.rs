use clap::Parser;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;
pub const DEFAULT_MAX_NAME_LEN: usize = 32;
pub const DEFAULT_RATE_LIMIT: u32 = 5;
pub const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";

/// TCP chat relay server
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "chat-relay", version, about = "TCP chat relay server")]
pub struct Config {
    /// Address to bind
    #[arg(long, env = "CHAT_RELAY_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Frames queued per client before it is treated as unreachable
    #[arg(long, env = "CHAT_RELAY_OUTBOX_CAPACITY", default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub outbox_capacity: usize,

    /// Longest accepted frame in bytes, delimiter excluded
    #[arg(long, env = "CHAT_RELAY_MAX_FRAME_LEN", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    /// Longest accepted username in characters
    #[arg(long, env = "CHAT_RELAY_MAX_NAME_LEN", default_value_t = DEFAULT_MAX_NAME_LEN)]
    pub max_name_len: usize,

    /// Chat messages a client may send per second. 0 disables the limit.
    #[arg(long, env = "CHAT_RELAY_RATE_LIMIT", default_value_t = DEFAULT_RATE_LIMIT)]
    pub rate_limit: u32,

    /// Address to bind the management channel
    #[arg(long, env = "CHAT_RELAY_ADMIN_HOST", default_value = DEFAULT_ADMIN_HOST)]
    pub admin_host: String,

    /// Port for the management channel. Off unless set.
    #[arg(long, env = "CHAT_RELAY_ADMIN_PORT")]
    pub admin_port: Option<u16>,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn admin_addr(&self) -> Option<String> {
        self.admin_port
            .map(|port| format!("{}:{}", self.admin_host, port))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_name_len: DEFAULT_MAX_NAME_LEN,
            rate_limit: DEFAULT_RATE_LIMIT,
            admin_host: DEFAULT_ADMIN_HOST.to_string(),
            admin_port: None,
        }
    }
}
