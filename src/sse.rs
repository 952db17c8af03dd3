//! Búfer de líneas para flujos Server-Sent-Events.
//!
//! Los trozos de bytes pueden cortar una línea (o un carácter UTF-8
//! multibyte) por cualquier punto; el búfer retiene el segmento incompleto
//! hasta que llega el resto, de modo que el resultado no depende de cómo se
//! haya troceado el flujo.

/// Prefijo de las líneas de datos.
pub const DATA_PREFIX: &str = "data:";
/// Centinela de fin de flujo que algunos backends envían como dato.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct SseLineBuffer {
    /// Bytes de un carácter UTF-8 todavía incompleto.
    pending: Vec<u8>,
    /// Texto decodificado desde el último salto de línea.
    partial: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Añade un trozo del flujo y devuelve las líneas completas que cierra.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut consumed = 0;
        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(text) => {
                    self.partial.push_str(text);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = &self.pending[consumed..consumed + e.valid_up_to()];
                    self.partial.push_str(&String::from_utf8_lossy(valid));
                    consumed += e.valid_up_to();
                    match e.error_len() {
                        Some(invalid) => {
                            self.partial.push(char::REPLACEMENT_CHARACTER);
                            consumed += invalid;
                        }
                        // Carácter incompleto al final: espera al siguiente trozo.
                        None => break,
                    }
                }
            }
        }
        self.pending.drain(..consumed);
        self.drain_lines()
    }

    /// Cierra el flujo y devuelve la última línea si quedó sin salto final.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let bytes = std::mem::take(&mut self.pending);
            self.partial.push_str(&String::from_utf8_lossy(&bytes));
        }
        let rest = std::mem::take(&mut self.partial);
        let rest = rest.strip_suffix('\r').unwrap_or(&rest);
        (!rest.is_empty()).then(|| rest.to_string())
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.partial.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);

        complete
            .split_terminator('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
            .collect()
    }
}

/// Extrae la carga útil de una línea `data: …`. Devuelve `None` para
/// cualquier otra línea, para datos vacíos y para `[DONE]`.
pub fn data_payload(line: &str) -> Option<&str> {
    let payload = line.strip_prefix(DATA_PREFIX)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload).trim();
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }
    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_lines_are_returned() {
        let mut buffer = SseLineBuffer::new();
        let lines = buffer.push(b"data: {\"a\":1}\ndata: {\"b\":2}\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "data: {\"b\":2}"]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_partial_line_is_held_back() {
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.push(b"data: {\"chu").is_empty());
        assert!(buffer.push(b"nk\":\"Hola").is_empty());
        assert_eq!(buffer.push(b"\"}\ndata: x"), vec!["data: {\"chunk\":\"Hola\"}"]);
        assert_eq!(buffer.finish().as_deref(), Some("data: x"));
    }

    #[test]
    fn test_empty_lines_are_kept_as_separators() {
        let mut buffer = SseLineBuffer::new();
        let lines = buffer.push(b"data: 1\n\ndata: 2\n\n");
        assert_eq!(lines, vec!["data: 1", "", "data: 2", ""]);
    }

    #[test]
    fn test_crlf_is_stripped() {
        let mut buffer = SseLineBuffer::new();
        assert_eq!(buffer.push(b"data: 1\r\n"), vec!["data: 1"]);
        assert!(buffer.push(b"data: 2\r").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("data: 2"));
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let text = "data: {\"chunk\":\"Ósmosis\"}\n".as_bytes();
        // "Ó" ocupa dos bytes; cortamos justo entre ellos.
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.push(&text[..split]).is_empty());
        assert_eq!(
            buffer.push(&text[split..]),
            vec!["data: {\"chunk\":\"Ósmosis\"}"]
        );
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut buffer = SseLineBuffer::new();
        let lines = buffer.push(b"data: a\xFFb\n");
        assert_eq!(lines, vec!["data: a\u{FFFD}b"]);
    }

    #[test]
    fn test_invalid_byte_and_split_char_in_same_chunk() {
        let text: &[u8] = b"data: a\xFFb \xC3\x93x\n";
        let mut whole = SseLineBuffer::new();
        let expected = whole.push(text);
        assert_eq!(expected, vec!["data: a\u{FFFD}b \u{D3}x"]);

        for split in 1..text.len() {
            let mut buffer = SseLineBuffer::new();
            let mut lines = buffer.push(&text[..split]);
            lines.extend(buffer.push(&text[split..]));
            assert_eq!(lines, expected, "corte en el byte {split}");
        }
    }

    #[test]
    fn test_data_payload() {
        assert_eq!(data_payload("data: {\"event\":\"phase\"}"), Some("{\"event\":\"phase\"}"));
        assert_eq!(data_payload("data:{\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(data_payload("data: [DONE]"), None);
        assert_eq!(data_payload("data: "), None);
        assert_eq!(data_payload("event: message"), None);
        assert_eq!(data_payload(": keep-alive"), None);
        assert_eq!(data_payload(""), None);
    }
}
