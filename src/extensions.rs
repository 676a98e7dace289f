//! WebSocket 圧縮拡張ネゴシエーション (RFC 7692)
//!
//! ## 概要
//!
//! `Sec-WebSocket-Extensions` リクエストヘッダーの提案を読み取り、
//! サーバー側の希望と突き合わせて圧縮パラメータとレスポンスヘッダー値を決定します。
//!
//! - 標準の `permessage-deflate` と非標準の `x-webkit-deflate-frame` に対応
//! - ネゴシエーション失敗はエラーではなく「圧縮なし」として返す
//! - 同じ入力に対して常に同じ結果を返す純粋関数
//!
//! ## 使い方
//!
//! ```rust
//! use shiguredo_http_proto::extensions::negotiate_compression;
//!
//! let params = negotiate_compression(
//!     true,
//!     15,
//!     11,
//!     "permessage-deflate; client_max_window_bits=9",
//! );
//! assert!(params.enabled);
//! assert_eq!(params.inflation_window_bits, 9);
//! assert_eq!(params.response, "permessage-deflate; client_max_window_bits=9");
//! ```

use core::fmt;

use tracing::debug;

/// 拡張提案中で認識するキーワード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    /// `permessage-deflate`
    PerMessageDeflate,
    /// `x-webkit-deflate-frame`
    XWebkitDeflateFrame,
    /// `no_context_takeover` (webkit)
    NoContextTakeover,
    /// `max_window_bits` (webkit)
    MaxWindowBits,
    /// `server_no_context_takeover`
    ServerNoContextTakeover,
    /// `client_no_context_takeover`
    ClientNoContextTakeover,
    /// `server_max_window_bits`
    ServerMaxWindowBits,
    /// `client_max_window_bits`
    ClientMaxWindowBits,
}

impl Keyword {
    fn from_bytes(token: &[u8]) -> Option<Self> {
        const KEYWORDS: [(&str, Keyword); 8] = [
            ("permessage-deflate", Keyword::PerMessageDeflate),
            ("x-webkit-deflate-frame", Keyword::XWebkitDeflateFrame),
            ("no_context_takeover", Keyword::NoContextTakeover),
            ("max_window_bits", Keyword::MaxWindowBits),
            ("server_no_context_takeover", Keyword::ServerNoContextTakeover),
            ("client_no_context_takeover", Keyword::ClientNoContextTakeover),
            ("server_max_window_bits", Keyword::ServerMaxWindowBits),
            ("client_max_window_bits", Keyword::ClientMaxWindowBits),
        ];
        KEYWORDS
            .iter()
            .find(|(name, _)| name.as_bytes().eq_ignore_ascii_case(token))
            .map(|(_, keyword)| *keyword)
    }
}

/// 拡張提案のトークン
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// 認識したキーワード
    Keyword(Keyword),
    /// 数字のみからなるトークン (`=` の後のパラメータ値)
    Number(i32),
    /// 認識しないトークン
    Unknown,
}

/// 拡張提案のトークン列
///
/// 英数字以外を読み飛ばし、英数字 / `-` / `_` の並びを 1 トークンとして返す。
#[derive(Debug, Clone)]
pub struct Tokens<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Tokens<'a> {
    /// トークン列を作成
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }
}

impl Iterator for Tokens<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        while self.pos < self.input.len() && !self.input[self.pos].is_ascii_alphanumeric() {
            self.pos += 1;
        }
        if self.pos >= self.input.len() {
            return None;
        }

        let start = self.pos;
        while self.pos < self.input.len()
            && matches!(self.input[self.pos], b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'-' | b'_')
        {
            self.pos += 1;
        }
        let token = &self.input[start..self.pos];

        if token.iter().all(u8::is_ascii_digit) {
            // 巨大な値は飽和させる (後段の範囲検査で必ず弾かれる)
            let value = token.iter().fold(0i32, |acc, b| {
                acc.saturating_mul(10).saturating_add(i32::from(b - b'0'))
            });
            return Some(Token::Number(value));
        }

        Some(match Keyword::from_bytes(token) {
            Some(keyword) => Token::Keyword(keyword),
            None => Token::Unknown,
        })
    }
}

/// 圧縮拡張の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeflateVariant {
    /// `permessage-deflate` (RFC 7692)
    PerMessageDeflate,
    /// `x-webkit-deflate-frame` (非標準)
    XWebkitDeflateFrame,
}

impl DeflateVariant {
    fn keyword(self) -> Keyword {
        match self {
            DeflateVariant::PerMessageDeflate => Keyword::PerMessageDeflate,
            DeflateVariant::XWebkitDeflateFrame => Keyword::XWebkitDeflateFrame,
        }
    }
}

impl fmt::Display for DeflateVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeflateVariant::PerMessageDeflate => write!(f, "permessage-deflate"),
            DeflateVariant::XWebkitDeflateFrame => write!(f, "x-webkit-deflate-frame"),
        }
    }
}

/// ウィンドウビット数パラメータ
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WindowBitsParam {
    /// 提案に含まれない
    #[default]
    Absent,
    /// 値なしで含まれる
    Bare,
    /// 値付きで含まれる
    Value(i32),
}

impl WindowBitsParam {
    /// 有効な値 (0 以外) を取得
    fn value(self) -> Option<i32> {
        match self {
            WindowBitsParam::Value(v) if v != 0 => Some(v),
            _ => None,
        }
    }
}

/// パース済みの圧縮拡張提案
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeflateOffer {
    /// 最初に現れた圧縮拡張
    pub variant: Option<DeflateVariant>,
    /// 選択した拡張名が 2 回以上現れた
    pub duplicate: bool,
    /// `no_context_takeover` (webkit)
    pub no_context_takeover: bool,
    /// `max_window_bits` (webkit)
    pub max_window_bits: WindowBitsParam,
    /// `server_no_context_takeover`
    pub server_no_context_takeover: bool,
    /// `client_no_context_takeover`
    pub client_no_context_takeover: bool,
    /// `server_max_window_bits`
    pub server_max_window_bits: WindowBitsParam,
    /// `client_max_window_bits`
    pub client_max_window_bits: WindowBitsParam,
}

#[derive(Debug, Clone, Copy)]
enum ParamSlot {
    MaxWindowBits,
    ServerMaxWindowBits,
    ClientMaxWindowBits,
}

impl DeflateOffer {
    /// 拡張提案をパース
    ///
    /// 最初の `permessage-deflate` または `x-webkit-deflate-frame` より前のトークンは無視する。
    /// 数値トークンは直前に値を要求したパラメータに割り当てる。
    pub fn parse(offer: &str) -> Self {
        Self::parse_bytes(offer.as_bytes())
    }

    /// バイト列の拡張提案をパース
    pub fn parse_bytes(offer: &[u8]) -> Self {
        let mut result = DeflateOffer::default();
        let mut tokens = Tokens::new(offer);

        let variant = loop {
            match tokens.next() {
                None => return result,
                Some(Token::Keyword(Keyword::PerMessageDeflate)) => {
                    break DeflateVariant::PerMessageDeflate;
                }
                Some(Token::Keyword(Keyword::XWebkitDeflateFrame)) => {
                    break DeflateVariant::XWebkitDeflateFrame;
                }
                Some(_) => {}
            }
        };
        result.variant = Some(variant);

        let mut last_slot = None;
        for token in tokens {
            match token {
                Token::Keyword(keyword) if keyword == variant.keyword() => {
                    result.duplicate = true;
                    break;
                }
                // 選ばなかった方の圧縮拡張は読み飛ばす
                Token::Keyword(Keyword::PerMessageDeflate | Keyword::XWebkitDeflateFrame) => {}
                Token::Keyword(Keyword::NoContextTakeover) => {
                    result.no_context_takeover = true;
                }
                Token::Keyword(Keyword::ServerNoContextTakeover) => {
                    result.server_no_context_takeover = true;
                }
                Token::Keyword(Keyword::ClientNoContextTakeover) => {
                    result.client_no_context_takeover = true;
                }
                Token::Keyword(Keyword::MaxWindowBits) => {
                    result.max_window_bits = WindowBitsParam::Bare;
                    last_slot = Some(ParamSlot::MaxWindowBits);
                }
                Token::Keyword(Keyword::ServerMaxWindowBits) => {
                    result.server_max_window_bits = WindowBitsParam::Bare;
                    last_slot = Some(ParamSlot::ServerMaxWindowBits);
                }
                Token::Keyword(Keyword::ClientMaxWindowBits) => {
                    result.client_max_window_bits = WindowBitsParam::Bare;
                    last_slot = Some(ParamSlot::ClientMaxWindowBits);
                }
                Token::Number(value) => {
                    let param = match last_slot {
                        Some(ParamSlot::MaxWindowBits) => &mut result.max_window_bits,
                        Some(ParamSlot::ServerMaxWindowBits) => &mut result.server_max_window_bits,
                        Some(ParamSlot::ClientMaxWindowBits) => &mut result.client_max_window_bits,
                        None => continue,
                    };
                    *param = WindowBitsParam::Value(value);
                }
                Token::Unknown => {}
            }
        }

        result
    }
}

/// 8..=15 のウィンドウビット数
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowBits(u8);

impl WindowBits {
    /// 最小値
    pub const MIN: u8 = 8;
    /// 最大値
    pub const MAX: u8 = 15;

    /// 範囲内であれば作成
    pub fn new(bits: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&bits).then_some(Self(bits))
    }

    /// 値を取得
    pub fn get(self) -> u8 {
        self.0
    }
}

/// 片方向の圧縮状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// 圧縮しない
    Disabled,
    /// 共有の圧縮器を使い、メッセージ間で文脈を持ち越さない
    Shared,
    /// 接続専用の圧縮器を指定のウィンドウで使う
    Dedicated(WindowBits),
}

impl WindowMode {
    /// ネゴシエーション入力用のウィンドウビット数 (共有 / 無効は 0)
    pub fn window_bits(self) -> u8 {
        match self {
            WindowMode::Disabled | WindowMode::Shared => 0,
            WindowMode::Dedicated(bits) => bits.get(),
        }
    }

    fn from_negotiated(bits: u8) -> Self {
        match WindowBits::new(bits) {
            Some(bits) => WindowMode::Dedicated(bits),
            None => WindowMode::Shared,
        }
    }
}

/// サーバー側の圧縮設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressOptions {
    /// 送信 (圧縮) 側
    pub compressor: WindowMode,
    /// 受信 (展開) 側
    pub decompressor: WindowMode,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self::disabled()
    }
}

impl CompressOptions {
    /// 圧縮なし
    pub fn disabled() -> Self {
        Self {
            compressor: WindowMode::Disabled,
            decompressor: WindowMode::Disabled,
        }
    }

    /// 共有の圧縮器と展開器
    pub fn shared() -> Self {
        Self {
            compressor: WindowMode::Shared,
            decompressor: WindowMode::Shared,
        }
    }

    /// 専用の圧縮器と展開器
    pub fn dedicated(compressor: WindowBits, decompressor: WindowBits) -> Self {
        Self {
            compressor: WindowMode::Dedicated(compressor),
            decompressor: WindowMode::Dedicated(decompressor),
        }
    }

    /// 圧縮を希望するかどうか
    pub fn is_enabled(&self) -> bool {
        self.compressor != WindowMode::Disabled
    }
}

/// ネゴシエーションの方針
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationPolicy {
    /// webkit 拡張で相手が `no_context_takeover` を要求し、こちらが専用圧縮器を
    /// 希望している場合に圧縮自体を拒否する (デフォルト: false、共有圧縮器に切り替える)
    pub reject_mixed_compressor: bool,
}

/// ネゴシエーション結果
///
/// `enabled` が true の場合、ウィンドウビット数は 0 (共有) か 8..=15 のいずれか。
/// `response` は `enabled` が false のときに限り空になる。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedParams {
    /// 圧縮を使うかどうか
    pub enabled: bool,
    /// 送信側のウィンドウビット数
    pub compression_window_bits: u8,
    /// 受信側のウィンドウビット数
    pub inflation_window_bits: u8,
    /// `Sec-WebSocket-Extensions` レスポンスヘッダー値
    pub response: String,
}

impl NegotiatedParams {
    /// 圧縮なし
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            compression_window_bits: 0,
            inflation_window_bits: 0,
            response: String::new(),
        }
    }

    /// 送信側の圧縮状態
    pub fn compressor(&self) -> WindowMode {
        if !self.enabled {
            return WindowMode::Disabled;
        }
        WindowMode::from_negotiated(self.compression_window_bits)
    }

    /// 受信側の圧縮状態
    pub fn decompressor(&self) -> WindowMode {
        if !self.enabled {
            return WindowMode::Disabled;
        }
        WindowMode::from_negotiated(self.inflation_window_bits)
    }
}

/// 圧縮パラメータをネゴシエーション
///
/// ウィンドウビット数の 0 は「共有圧縮器 (文脈の持ち越しなし)」を意味する。
pub fn negotiate_compression(
    want_compression: bool,
    wanted_compression_window_bits: u8,
    wanted_inflation_window_bits: u8,
    offer: &str,
) -> NegotiatedParams {
    negotiate_compression_with(
        &NegotiationPolicy::default(),
        want_compression,
        wanted_compression_window_bits,
        wanted_inflation_window_bits,
        offer,
    )
}

/// 設定からネゴシエーション
pub fn negotiate(options: &CompressOptions, offer: &str) -> NegotiatedParams {
    negotiate_compression(
        options.is_enabled(),
        options.compressor.window_bits(),
        options.decompressor.window_bits(),
        offer,
    )
}

/// 方針を指定して圧縮パラメータをネゴシエーション
pub fn negotiate_compression_with(
    policy: &NegotiationPolicy,
    want_compression: bool,
    wanted_compression_window_bits: u8,
    wanted_inflation_window_bits: u8,
    offer: &str,
) -> NegotiatedParams {
    if !want_compression {
        return NegotiatedParams::disabled();
    }

    let offer = DeflateOffer::parse(offer);
    if offer.duplicate {
        debug!("duplicate compression extension in offer, compression disabled");
        return NegotiatedParams::disabled();
    }

    let compression = i32::from(wanted_compression_window_bits);
    let inflation = i32::from(wanted_inflation_window_bits);

    let outcome = match offer.variant {
        None => Some(Outcome {
            enabled: false,
            compression,
            inflation,
            response: String::new(),
        }),
        Some(DeflateVariant::XWebkitDeflateFrame) => {
            negotiate_webkit(policy, &offer, compression, inflation)
        }
        Some(DeflateVariant::PerMessageDeflate) => {
            negotiate_permessage_deflate(&offer, compression, inflation)
        }
    };

    let Some(outcome) = outcome else {
        debug!(?offer.variant, "compression offer refused");
        return NegotiatedParams::disabled();
    };

    // 0 以外は 8..=15 でなければならない
    let (Some(compression), Some(inflation)) = (
        checked_window(outcome.compression),
        checked_window(outcome.inflation),
    ) else {
        debug!(
            compression = outcome.compression,
            inflation = outcome.inflation,
            "negotiated window bits out of range, compression disabled"
        );
        return NegotiatedParams::disabled();
    };

    NegotiatedParams {
        enabled: outcome.enabled,
        compression_window_bits: compression,
        inflation_window_bits: inflation,
        response: outcome.response,
    }
}

struct Outcome {
    enabled: bool,
    compression: i32,
    inflation: i32,
    response: String,
}

fn negotiate_webkit(
    policy: &NegotiationPolicy,
    offer: &DeflateOffer,
    mut compression: i32,
    inflation: i32,
) -> Option<Outcome> {
    // 相手が文脈の持ち越しを禁止した場合は共有圧縮器しか使えない
    if offer.no_context_takeover {
        if policy.reject_mixed_compressor && compression != 0 {
            return None;
        }
        compression = 0;
    }

    match offer.max_window_bits {
        WindowBitsParam::Absent => {}
        // 値のない max_window_bits は共有圧縮器でなければ満たせない
        WindowBitsParam::Bare => {
            if compression > 1 {
                return None;
            }
        }
        WindowBitsParam::Value(bits) => {
            if bits != 0 && bits < compression {
                compression = bits;
                // 圧縮器は 8 ビットウィンドウを扱えない
                if compression == 8 {
                    return None;
                }
            }
        }
    }

    let mut response = DeflateVariant::XWebkitDeflateFrame.to_string();
    if inflation < 15 {
        if inflation == 0 {
            response.push_str("; no_context_takeover");
        } else {
            response.push_str(&format!("; max_window_bits={}", inflation));
        }
    }

    Some(Outcome {
        enabled: true,
        compression,
        inflation,
        response,
    })
}

fn negotiate_permessage_deflate(
    offer: &DeflateOffer,
    mut compression: i32,
    mut inflation: i32,
) -> Option<Outcome> {
    let mut response = DeflateVariant::PerMessageDeflate.to_string();

    if offer.client_no_context_takeover {
        inflation = 0;
    } else if let Some(bits) = offer.client_max_window_bits.value() {
        inflation = inflation.min(bits);
    }

    if inflation < 15 {
        // client_max_window_bits を提案しない相手にはウィンドウを指定できない
        if inflation == 0 || offer.client_max_window_bits == WindowBitsParam::Absent {
            response.push_str("; client_no_context_takeover");
            inflation = 0;
        } else {
            response.push_str(&format!("; client_max_window_bits={}", inflation));
        }
    }

    // server_no_context_takeover では送信側を変更しない
    if !offer.server_no_context_takeover {
        match offer.server_max_window_bits {
            WindowBitsParam::Absent => {}
            WindowBitsParam::Bare => {
                if compression != 0 {
                    return None;
                }
            }
            WindowBitsParam::Value(bits) => {
                if bits != 0 {
                    compression = compression.min(bits);
                    // 圧縮器は 8 ビットウィンドウを扱えないため 9 に切り上げる
                    if compression == 8 {
                        compression = 9;
                    }
                }
            }
        }
    }

    if compression < 15 {
        if compression == 0 {
            response.push_str("; server_no_context_takeover");
        } else {
            response.push_str(&format!("; server_max_window_bits={}", compression));
        }
    }

    Some(Outcome {
        enabled: true,
        compression,
        inflation,
        response,
    })
}

fn checked_window(bits: i32) -> Option<u8> {
    if bits == 0 || (8..=15).contains(&bits) {
        u8::try_from(bits).ok()
    } else {
        None
    }
}
