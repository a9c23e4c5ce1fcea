//! Format-specific post-processing of converter output.
//!
//! Both processors are fail-soft: content that does not parse in the
//! expected format is returned unmodified.

pub mod clash;
pub mod singbox;

/// Run the post-processor matching `target`, if one exists.
pub fn postprocess(target: &str, body: &[u8]) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(body) else {
        return body.to_vec();
    };
    match target {
        "clash" | "clashr" => clash::process(text).into_bytes(),
        "singbox" => singbox::process(text).into_bytes(),
        _ => body.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_target_passes_through() {
        assert_eq!(postprocess("v2ray", b"abc"), b"abc");
    }

    #[test]
    fn non_utf8_passes_through() {
        let raw = vec![0xff, 0xfe, 0x00];
        assert_eq!(postprocess("clash", &raw), raw);
    }
}
