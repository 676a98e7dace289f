/// ヘッダーブロックパーサーの制限設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserLimits {
    /// 最大ヘッダー数 (デフォルト: 10)
    ///
    /// これを超えるヘッダーがあった場合は切り捨てずにパースエラーとする。
    pub max_headers: usize,
    /// ヘッダーブロックの最大バイト数 (デフォルト: 4KB)
    ///
    /// 終端の空行を含めた消費バイト数がこの値を超えるとエラーになる。
    pub max_header_block_size: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_headers: 10,
            max_header_block_size: 4 * 1024, // 4KB
        }
    }
}

impl ParserLimits {
    /// 制限なしの設定を作成
    pub fn unlimited() -> Self {
        Self {
            max_headers: usize::MAX,
            max_header_block_size: usize::MAX,
        }
    }

    /// 最大ヘッダー数を指定して作成
    pub fn with_max_headers(max_headers: usize) -> Self {
        Self {
            max_headers,
            ..Self::default()
        }
    }
}

/// WebSocket 送信側の制限設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketLimits {
    /// 送信待ちバイト数の上限 (デフォルト: 64KB)
    ///
    /// 送信待ちがこの値を超えている状態での `send` は破棄される。
    pub max_backpressure: usize,
    /// 上限を超えたときに接続を閉じるかどうか (デフォルト: false)
    pub close_on_backpressure_limit: bool,
}

impl Default for WebSocketLimits {
    fn default() -> Self {
        Self {
            max_backpressure: 64 * 1024, // 64KB
            close_on_backpressure_limit: false,
        }
    }
}

impl WebSocketLimits {
    /// 制限なしの設定を作成
    pub fn unlimited() -> Self {
        Self {
            max_backpressure: usize::MAX,
            close_on_backpressure_limit: false,
        }
    }
}
