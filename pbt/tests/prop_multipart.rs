//! multipart/form-data のプロパティテスト

use proptest::prelude::*;
use shiguredo_http_proto::multipart::{MultipartBuilder, MultipartParser};

// ========================================
// Strategy 定義
// ========================================

// 有効なフィールド名 (RFC 7578)
fn valid_field_name() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_]{0,15}".prop_map(|s| s)
}

// 有効なファイル名
fn valid_filename() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_]{1,16}\\.[a-z]{1,4}".prop_map(|s| s)
}

// 有効なテキスト値
fn valid_text_value() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 .,!?]{0,64}".prop_map(|s| s)
}

// 有効な境界文字列
fn valid_boundary() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9]{8,32}".prop_map(|s| s)
}

// 有効な MIME タイプ
fn valid_mime_type() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("text/plain".to_string()),
        Just("application/json".to_string()),
        Just("application/octet-stream".to_string()),
        Just("image/png".to_string()),
    ]
}

#[derive(Debug, Clone)]
enum Field {
    Text(String, String),
    File(String, String, String, Vec<u8>),
}

fn field() -> impl Strategy<Value = Field> {
    prop_oneof![
        (valid_field_name(), valid_text_value()).prop_map(|(n, v)| Field::Text(n, v)),
        (
            valid_field_name(),
            valid_filename(),
            valid_mime_type(),
            // 境界と衝突しないよう `-` を含めない
            proptest::collection::vec(any::<u8>().prop_filter("no dash", |b| *b != b'-'), 0..64),
        )
            .prop_map(|(n, f, m, d)| Field::File(n, f, m, d)),
    ]
}

fn fields() -> impl Strategy<Value = Vec<Field>> {
    prop::sample::select(vec![0usize, 1, 5])
        .prop_flat_map(|n| proptest::collection::vec(field(), n))
}

// ========================================
// ラウンドトリップ
// ========================================

proptest! {
    #[test]
    fn build_then_parse(boundary in valid_boundary(), fields in fields()) {
        let mut builder = MultipartBuilder::with_boundary(&boundary);
        for f in &fields {
            builder = match f {
                Field::Text(name, value) => builder.text_field(name, value),
                Field::File(name, filename, mime, data) => {
                    builder.file_field(name, filename, mime, data)
                }
            };
        }
        let body = builder.build();

        let mut parser = MultipartParser::new(&builder.content_type());
        prop_assert!(parser.is_valid());
        prop_assert_eq!(parser.boundary(), Some(boundary.as_bytes()));
        parser.set_body(&body).unwrap();

        for f in &fields {
            let part = parser.next_part().unwrap().unwrap();
            match f {
                Field::Text(name, value) => {
                    let part_name = part.name();
                    prop_assert_eq!(part_name.as_deref(), Some(name.as_str()));
                    prop_assert_eq!(part.body(), value.as_bytes());
                    prop_assert!(!part.is_file());
                }
                Field::File(name, filename, mime, data) => {
                    let part_name = part.name();
                    prop_assert_eq!(part_name.as_deref(), Some(name.as_str()));
                    let part_filename = part.filename();
                    prop_assert_eq!(part_filename.as_deref(), Some(filename.as_str()));
                    prop_assert_eq!(part.content_type(), Some(mime.as_str()));
                    prop_assert_eq!(part.body(), data.as_slice());
                }
            }
        }
        prop_assert!(parser.next_part().unwrap().is_none());
        prop_assert!(parser.is_finished());
    }

    #[test]
    fn preamble_is_skipped(
        boundary in valid_boundary(),
        preamble in "[a-z ]{0,32}",
        value in valid_text_value()
    ) {
        let builder = MultipartBuilder::with_boundary(&boundary).text_field("field", &value);
        let mut body = format!("{}\r\n", preamble).into_bytes();
        body.extend_from_slice(&builder.build());

        let mut parser = MultipartParser::new(&builder.content_type());
        parser.set_body(&body).unwrap();
        let part = parser.next_part().unwrap().unwrap();
        prop_assert_eq!(part.body(), value.as_bytes());
        prop_assert!(parser.next_part().unwrap().is_none());
    }

    #[test]
    fn truncated_body_never_yields_last_part(
        boundary in valid_boundary(),
        value in "[a-z]{1,32}",
        cut in 1usize..16
    ) {
        let builder = MultipartBuilder::with_boundary(&boundary).text_field("field", &value);
        let body = builder.build();
        // 終了境界の途中で切る
        let end = body.len() - boundary.len() - 6 + cut.min(boundary.len());
        let truncated = &body[..end];

        let mut parser = MultipartParser::new(&builder.content_type());
        parser.set_body(truncated).unwrap();
        prop_assert!(parser.next_part().is_err());
        prop_assert!(parser.next_part().unwrap().is_none());
    }

    #[test]
    fn arbitrary_body_never_panics(
        boundary in valid_boundary(),
        body in proptest::collection::vec(any::<u8>(), 0..256)
    ) {
        let content_type = format!("multipart/form-data; boundary={}", boundary);
        let mut parser = MultipartParser::new(&content_type);
        parser.set_body(&body).unwrap();
        let mut parts = 0;
        loop {
            match parser.next_part() {
                Ok(Some(_)) => parts += 1,
                Ok(None) | Err(_) => break,
            }
            prop_assert!(parts <= body.len());
        }
        prop_assert!(parser.next_part().unwrap().is_none());
    }

    #[test]
    fn non_multipart_content_type_is_invalid(subtype in "[a-z]{1,10}/[a-z]{1,10}") {
        prop_assume!(!subtype.starts_with("multipart/"));
        let mut parser = MultipartParser::new(&subtype);
        prop_assert!(!parser.is_valid());
        prop_assert!(parser.next_part().is_err());
    }
}
