#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shiguredo_http_proto::{HeaderBlockParser, ParserLimits};

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    max_headers: u8,
    max_header_block_size: u16,
    multipart: bool,
    data: Vec<u8>,
}

fuzz_target!(|input: FuzzInput| {
    let limits = ParserLimits {
        max_headers: usize::from(input.max_headers),
        max_header_block_size: usize::from(input.max_header_block_size),
    };
    let parser = if input.multipart {
        HeaderBlockParser::for_multipart()
    } else {
        HeaderBlockParser::new()
    }
    .with_limits(limits.clone());

    if let Ok((headers, consumed)) = parser.parse(&input.data) {
        assert!(consumed <= input.data.len());
        assert!(consumed <= limits.max_header_block_size);
        assert!(headers.len() <= limits.max_headers);
        assert!(input.data[..consumed].ends_with(b"\r\n"));
        for header in &headers {
            // 名前は小文字、値の前後に空白はない
            assert!(!header.name().bytes().any(|b| b.is_ascii_uppercase()));
            assert!(!header.value().starts_with(b" "));
            assert!(!header.value().ends_with(b" "));
        }
    }
});
