#![no_main]

use libfuzzer_sys::fuzz_target;
use shiguredo_http_proto::multipart::MultipartParser;

fuzz_target!(|data: &[u8]| {
    // 様々な境界でパースを試行
    let content_types = [
        "multipart/form-data; boundary=boundary",
        "multipart/form-data; boundary=\"----WebKitFormBoundary\"",
        "multipart/mixed; charset=utf-8; boundary=abc123",
        "multipart/form-data; boundary=-",
    ];

    for content_type in content_types {
        let mut parser = MultipartParser::new(content_type);
        if parser.set_body(data).is_err() {
            continue;
        }

        // パニックしなければ OK
        while let Ok(Some(part)) = parser.next_part() {
            let _ = part.name();
            let _ = part.filename();
            let _ = part.content_type();
            let _ = part.body_str();
            let _ = part.is_file();
            assert!(part.body().len() <= data.len());
        }
        assert!(matches!(parser.next_part(), Ok(None)));
    }
});
