use serde::{Deserialize, Deserializer};
use std::time::Duration;
use thiserror::Error;

/// 适配循环与直连读通道单次系统调用预留的默认缓冲大小。
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8 * 1024;

/// 套接字描述符参数。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 建连阶段由调用方决定缓冲区、保活、`TCP_NODELAY` 与 `SO_LINGER` 等策略，
///   这些参数只影响底层描述符，不改变通道与适配循环的协议行为；
/// - 配置既可以通过 `with_*` 构造器在代码中声明，也可以从 TOML 片段加载。
///
/// ## 契约（What）
/// - 所有字段可选，`None` 表示沿用内核默认；`no_delay` 默认开启；
/// - `linger` 在 TOML 中以毫秒表示（`linger_ms`）；
/// - `read_chunk_size` 必须大于 0，[`from_toml_str`](Self::from_toml_str) 会拒绝 0。
///
/// ## 注意事项（Trade-offs）
/// - `keep_alive` 与 `no_delay` 仅对 TCP 描述符有意义，Unix 域套接字请保持 `None`/默认。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketOptions {
    send_buffer_size: Option<usize>,
    receive_buffer_size: Option<usize>,
    keep_alive: Option<bool>,
    no_delay: bool,
    #[serde(rename = "linger_ms", deserialize_with = "deserialize_millis")]
    linger: Option<Duration>,
    read_chunk_size: usize,
}

/// 解析套接字配置失败。
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("invalid socket options: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid socket options: {0}")]
    Invalid(&'static str),
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_buffer_size: None,
            receive_buffer_size: None,
            keep_alive: None,
            no_delay: true,
            linger: None,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl SocketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 片段解析配置，未出现的字段取默认值。
    pub fn from_toml_str(source: &str) -> Result<Self, OptionsError> {
        let options: SocketOptions = toml::from_str(source)?;
        if options.read_chunk_size == 0 {
            return Err(OptionsError::Invalid("read_chunk_size must be positive"));
        }
        Ok(options)
    }

    pub fn with_send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = Some(size);
        self
    }

    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = Some(enabled);
        self
    }

    pub fn with_no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// 设置 `SO_LINGER`；`None` 表示沿用内核默认。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// 设置单次读取预留的缓冲大小，0 会被提升为 1。
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    pub fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size
    }

    pub fn receive_buffer_size(&self) -> Option<usize> {
        self.receive_buffer_size
    }

    pub fn keep_alive(&self) -> Option<bool> {
        self.keep_alive
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size
    }
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_no_delay() {
        let options = SocketOptions::default();
        assert!(options.no_delay());
        assert_eq!(options.read_chunk_size(), DEFAULT_READ_CHUNK_SIZE);
        assert_eq!(options.linger(), None);
    }

    #[test]
    fn toml_fragment_overrides_selected_fields() {
        let options = SocketOptions::from_toml_str(
            r#"
            send_buffer_size = 65536
            keep_alive = true
            no_delay = false
            linger_ms = 250
            "#,
        )
        .expect("合法配置");

        assert_eq!(options.send_buffer_size(), Some(65536));
        assert_eq!(options.receive_buffer_size(), None);
        assert_eq!(options.keep_alive(), Some(true));
        assert!(!options.no_delay());
        assert_eq!(options.linger(), Some(Duration::from_millis(250)));
        assert_eq!(options.read_chunk_size(), DEFAULT_READ_CHUNK_SIZE);
    }

    #[test]
    fn zero_read_chunk_is_rejected() {
        let err = SocketOptions::from_toml_str("read_chunk_size = 0").expect_err("0 非法");
        assert!(matches!(err, OptionsError::Invalid(_)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = SocketOptions::from_toml_str("nodelay = true").expect_err("拼写错误应被拒绝");
        assert!(matches!(err, OptionsError::Parse(_)));
    }

    #[test]
    fn builder_clamps_read_chunk() {
        let options = SocketOptions::new()
            .with_read_chunk_size(0)
            .with_linger(Some(Duration::from_secs(1)));
        assert_eq!(options.read_chunk_size(), 1);
        assert_eq!(options.linger(), Some(Duration::from_secs(1)));
    }
}
