/// One dispatched server-sent event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Split raw SSE text into frames. Multiple `data:` lines in one frame are
/// joined with newlines; comment lines are skipped.
pub fn parse_sse_lines(raw: &str) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    let mut event: Option<String> = None;
    let mut data: Vec<&str> = Vec::new();

    let mut flush = |event: &mut Option<String>, data: &mut Vec<&str>| {
        if event.is_some() || !data.is_empty() {
            frames.push(SseFrame {
                event: event.take(),
                data: data.join("\n"),
            });
            data.clear();
        }
    };

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            flush(&mut event, &mut data);
        } else if line.starts_with(':') {
            continue;
        } else if let Some(value) = field(line, "event") {
            event = Some(value.to_string());
        } else if let Some(value) = field(line, "data") {
            data.push(value);
        }
    }

    // Trailing frame without a blank line
    flush(&mut event, &mut data);

    frames
}

/// The `data` payloads of every frame, in order, which is what the stream
/// normalizer consumes.
pub fn data_payloads(raw: &str) -> Vec<String> {
    parse_sse_lines(raw)
        .into_iter()
        .filter(|f| !f.data.is_empty())
        .map(|f| f.data)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_style_frames() {
        let raw = "event: message_start\ndata: {\"type\":\"message_start\"}\n\nevent: ping\ndata: {\"type\": \"ping\"}\n\n";
        let frames = parse_sse_lines(raw);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, r#"{"type":"message_start"}"#);
        assert_eq!(frames[1].event.as_deref(), Some("ping"));
    }

    #[test]
    fn data_only_frames_and_done_sentinel() {
        let raw = "data: {\"choices\":[]}\n\ndata: [DONE]\n\n";
        assert_eq!(
            data_payloads(raw),
            vec![r#"{"choices":[]}"#.to_string(), "[DONE]".to_string()]
        );
    }

    #[test]
    fn multiline_data_comments_and_crlf() {
        let raw = ": keepalive\r\ndata:first\r\ndata: second\r\n\r\n";
        let frames = parse_sse_lines(raw);
        assert_eq!(
            frames,
            vec![SseFrame {
                event: None,
                data: "first\nsecond".into()
            }]
        );
    }

    #[test]
    fn trailing_frame_without_blank_line() {
        let frames = parse_sse_lines("event: message_stop\ndata: {}");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn lookalike_field_names_are_ignored() {
        let frames = parse_sse_lines("database: x\ndata: y\n\n");
        assert_eq!(frames[0].data, "y");
    }
}
