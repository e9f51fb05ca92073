//! GDB machine-interface framing.
//!
//! When a frontend drives the session through `--interpreter=mi`, everything
//! we print on the debugger's behalf must arrive as MI console records or the
//! frontend's parser chokes on it.

/// Record prefix for console output streams.
pub const CONSOLE_PREFIX: char = '~';

/// A session runs in MI mode when the client arguments select a machine
/// interpreter.
pub fn is_mi_mode(client_args: &[String]) -> bool {
    client_args.iter().any(|arg| arg.contains("--interpreter"))
}

/// Re-frame arbitrary text as a sequence of MI stream records.
///
/// Each input line becomes one `~"...\n"` record; backslashes and quotes are
/// escaped. Whether the input ended with a newline is preserved, so chunked
/// output can be framed incrementally without inventing line breaks.
pub fn escape_stream(prefix: char, text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let ends_nl = text.ends_with('\n');
    let mut segments: Vec<&str> = text.split('\n').collect();
    if ends_nl {
        // split() yields one empty segment after the trailing newline.
        segments.pop();
    }
    let count = segments.len();
    let mut records = Vec::with_capacity(count);
    for (idx, segment) in segments.iter().enumerate() {
        let escaped = segment.replace('\\', "\\\\").replace('"', "\\\"");
        if idx + 1 == count && !ends_nl {
            records.push(format!("{prefix}\"{escaped}\""));
        } else {
            records.push(format!("{prefix}\"{escaped}\\n\""));
        }
    }
    let mut framed = records.join("\n");
    if ends_nl {
        framed.push('\n');
    }
    framed
}

/// Frame text as console records.
pub fn console(text: &str) -> String {
    escape_stream(CONSOLE_PREFIX, text)
}
