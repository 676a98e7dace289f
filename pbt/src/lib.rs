//! PBT テスト共通ユーティリティ

use proptest::prelude::*;

// ========================================
// ヘッダー生成 (RFC 9110)
// ========================================

/// ヘッダー名: token (1-16 文字)
pub fn header_name() -> impl Strategy<Value = String> {
    "[A-Za-z0-9!#$%&'*+.^_`|~-]{1,16}".prop_map(|s| s)
}

/// ヘッダー値: 前後に空白を含まない可視文字列 (0-32 文字)
pub fn header_value() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        "[!-~]([ !-~]{0,30}[!-~])?".prop_map(|s| s),
    ]
}

/// コロンの後の空白
pub fn ows() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just(""), Just(" "), Just("\t"), Just("  ")]
}

/// ヘッダーブロック (終端の空行を含む) と、元のヘッダー列
pub fn header_block(max: usize) -> impl Strategy<Value = (Vec<u8>, Vec<(String, String)>)> {
    proptest::collection::vec((header_name(), ows(), header_value(), ows()), 1..=max).prop_map(
        |headers| {
            let mut block = Vec::new();
            let mut expected = Vec::new();
            for (name, before, value, after) in headers {
                let line = format!("{}:{}{}{}\r\n", name, before, value, after);
                block.extend_from_slice(line.as_bytes());
                expected.push((name, value));
            }
            block.extend_from_slice(b"\r\n");
            (block, expected)
        },
    )
}

// ========================================
// Sec-WebSocket-Extensions 生成
// ========================================

/// 拡張オファーのトークン (キーワード、数値、区切り、ゴミ)
pub fn extension_token() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("permessage-deflate".to_string()),
        Just("x-webkit-deflate-frame".to_string()),
        Just("client_no_context_takeover".to_string()),
        Just("server_no_context_takeover".to_string()),
        Just("client_max_window_bits".to_string()),
        Just("server_max_window_bits".to_string()),
        Just("max_window_bits".to_string()),
        Just("no_context_takeover".to_string()),
        (0u32..=20).prop_map(|n| n.to_string()),
        Just("=".to_string()),
        Just("; ".to_string()),
        Just(", ".to_string()),
        "[a-z_-]{1,8}".prop_map(|s| s),
    ]
}

/// 拡張オファー文字列
pub fn extension_offer() -> impl Strategy<Value = String> {
    proptest::collection::vec(extension_token(), 0..12).prop_map(|tokens| tokens.join(""))
}

/// 希望するウィンドウビット数 (0 または 8..=15)
pub fn wanted_window_bits() -> impl Strategy<Value = u8> {
    prop_oneof![Just(0u8), 8u8..=15]
}
