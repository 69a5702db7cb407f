//! Echo payload grammar.
//!
//! Controllers answer on `<prefix>/echo` with
//! `Received: <command>, Response: <value>#, Source: <tag>`. Payloads that do
//! not match are dropped by the caller; there is nothing to correlate them
//! with.

/// One parsed echo payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoFrame {
    /// Command text the device is answering, verbatim.
    pub command: String,
    /// Response value with the trailing `#` stripped.
    pub value: String,
    /// Originating transport tag.
    pub source: String,
}

/// Parse an echo payload, or `None` if it fails the grammar.
pub fn parse_echo(payload: &str) -> Option<EchoFrame> {
    let rest = payload.trim_start().strip_prefix("Received:")?;
    let (command, rest) = rest.split_once(',')?;

    let rest = rest.trim_start().strip_prefix("Response:")?;
    let (value, rest) = rest.split_once(',')?;

    let source = rest.trim_start().strip_prefix("Source:")?;

    let command = command.trim();
    let value = value.trim().trim_end_matches('#');
    let source = source.trim();
    if command.is_empty() || source.is_empty() {
        return None;
    }

    Some(EchoFrame {
        command: command.to_string(),
        value: value.to_string(),
        source: source.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_echo() {
        let frame =
            parse_echo("Received: :DZ#, Response: 306.640#, Source: MQTT").unwrap();
        assert_eq!(frame.command, ":DZ#");
        assert_eq!(frame.value, "306.640");
        assert_eq!(frame.source, "MQTT");
    }

    #[test]
    fn test_parse_error_code_echo() {
        let frame = parse_echo("Received: :RS#, Response: 3#, Source: MQTT").unwrap();
        assert_eq!(frame.command, ":RS#");
        assert_eq!(frame.value, "3");
    }

    #[test]
    fn test_parse_sexagesimal_value() {
        let frame =
            parse_echo("Received: :GD#, Response: +12*34'56#, Source: MQTT").unwrap();
        assert_eq!(frame.value, "+12*34'56");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(parse_echo(""), None);
        assert_eq!(parse_echo("Received: :DZ#"), None);
        assert_eq!(parse_echo("Received: :DZ#, Response: 1.0#"), None);
        assert_eq!(parse_echo("garbage, more garbage, Source: MQTT"), None);
        assert_eq!(parse_echo("Received: , Response: 1#, Source: MQTT"), None);
    }

    #[test]
    fn test_parse_empty_value() {
        // An empty response value is grammatical; some commands answer with
        // just the terminator.
        let frame = parse_echo("Received: :SA#, Response: #, Source: MQTT").unwrap();
        assert_eq!(frame.value, "");
    }
}
