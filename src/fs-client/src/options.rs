use crate::{ClientError, ClientResult};

/// Data-cache behaviour requested at mount time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheMode {
    Never,
    Yes,
    #[default]
    Auto,
    Direct,
}

impl CacheMode {
    pub fn parse(value: &str) -> ClientResult<CacheMode> {
        match value.to_ascii_uppercase().as_str() {
            "NEVER" => Ok(CacheMode::Never),
            "YES" => Ok(CacheMode::Yes),
            "AUTO" => Ok(CacheMode::Auto),
            "DIRECT" => Ok(CacheMode::Direct),
            other => Err(ClientError::BadOption(format!("cachemode {}", other))),
        }
    }
}

/// Mount-time tunables, with the historical defaults.
#[derive(Clone, Debug)]
pub struct MountOptions {
    pub master_host: String,
    pub master_port: u16,
    pub subfolder: String,
    pub cache_mode: CacheMode,
    pub chunkserver_connect_timeout_ms: u64,
    pub chunkserver_basic_read_timeout_ms: u64,
    pub chunkserver_total_read_timeout_ms: u64,
    pub chunkserver_write_timeout_ms: u64,
    pub write_workers: u32,
    pub io_retries: u32,
    pub write_window_size: u32,
    pub attr_cache_timeout: f64,
    pub entry_cache_timeout: f64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            master_host: "sfsmaster".to_string(),
            master_port: 9421,
            subfolder: String::new(),
            cache_mode: CacheMode::Auto,
            chunkserver_connect_timeout_ms: 2000,
            chunkserver_basic_read_timeout_ms: 2000,
            chunkserver_total_read_timeout_ms: 2000,
            chunkserver_write_timeout_ms: 5000,
            write_workers: 10,
            io_retries: 30,
            write_window_size: 15,
            attr_cache_timeout: 1.0,
            entry_cache_timeout: 0.0,
        }
    }
}

impl MountOptions {
    /// Parse a comma-separated `key=value` option string, the way the
    /// mount binary receives it.
    pub fn parse(option_string: &str) -> ClientResult<MountOptions> {
        let mut options = MountOptions::default();
        for item in option_string.split(',').filter(|s| !s.is_empty()) {
            let (key, value) = match item.split_once('=') {
                Some((key, value)) => (key, value),
                None => (item, ""),
            };
            match key {
                "sfsmaster" => options.master_host = value.to_string(),
                "sfsport" => {
                    options.master_port =
                        value.parse().map_err(|_| bad(key, value))?
                }
                "sfssubfolder" => options.subfolder = value.to_string(),
                "sfscachemode" => options.cache_mode = CacheMode::parse(value)?,
                "sfschunkserverconnectto" => {
                    options.chunkserver_connect_timeout_ms =
                        value.parse().map_err(|_| bad(key, value))?
                }
                "sfschunkserverreadto" => {
                    options.chunkserver_basic_read_timeout_ms =
                        value.parse().map_err(|_| bad(key, value))?
                }
                "sfschunkservertotalreadto" => {
                    options.chunkserver_total_read_timeout_ms =
                        value.parse().map_err(|_| bad(key, value))?
                }
                "sfschunkserverwriteto" => {
                    options.chunkserver_write_timeout_ms =
                        value.parse().map_err(|_| bad(key, value))?
                }
                "sfswriteworkers" => {
                    options.write_workers = value.parse().map_err(|_| bad(key, value))?
                }
                "sfsioretries" => {
                    options.io_retries = value.parse().map_err(|_| bad(key, value))?
                }
                "sfswritewindowsize" => {
                    options.write_window_size =
                        value.parse().map_err(|_| bad(key, value))?
                }
                "sfsattrcacheto" => {
                    options.attr_cache_timeout =
                        value.parse().map_err(|_| bad(key, value))?
                }
                "sfsentrycacheto" => {
                    options.entry_cache_timeout =
                        value.parse().map_err(|_| bad(key, value))?
                }
                other => return Err(ClientError::BadOption(other.to_string())),
            }
        }
        Ok(options)
    }

    pub fn chunkserver_timeouts(&self) -> chunk_io::ChunkserverTimeouts {
        chunk_io::ChunkserverTimeouts {
            connect_ms: self.chunkserver_connect_timeout_ms,
            basic_read_ms: self.chunkserver_basic_read_timeout_ms,
            total_read_ms: self.chunkserver_total_read_timeout_ms,
            write_ms: self.chunkserver_write_timeout_ms,
        }
    }
}

fn bad(key: &str, value: &str) -> ClientError {
    ClientError::BadOption(format!("{}={}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let options = MountOptions::default();
        assert_eq!(options.chunkserver_connect_timeout_ms, 2000);
        assert_eq!(options.chunkserver_write_timeout_ms, 5000);
        assert_eq!(options.io_retries, 30);
        assert_eq!(options.write_workers, 10);
        assert_eq!(options.write_window_size, 15);
    }

    #[test]
    fn option_string_parsing() {
        let options = MountOptions::parse(
            "sfsmaster=mfs.example.com,sfsport=9500,sfssubfolder=/data,sfscachemode=DIRECT,sfsioretries=5",
        )
        .unwrap();
        assert_eq!(options.master_host, "mfs.example.com");
        assert_eq!(options.master_port, 9500);
        assert_eq!(options.subfolder, "/data");
        assert_eq!(options.cache_mode, CacheMode::Direct);
        assert_eq!(options.io_retries, 5);
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert!(MountOptions::parse("sfsbogus=1").is_err());
        assert!(MountOptions::parse("sfscachemode=SOMETIMES").is_err());
    }
}
