// geowarden/src/protocol/assembler.rs
//
// Request reassembly from the policy line stream.
//
// Lines arrive one at a time from a connection. Non-empty lines are buffered
// verbatim; the empty line that ends an exchange turns the buffer into a
// PolicyRequest and clears it for the next one. A connection may carry any
// number of exchanges. A trailing fragment without its empty line is never
// turned into a request; the connection owner discards it on EOF.

use crate::events::PolicyRequest;

pub struct RequestAssembler {
    buffer: Vec<String>,
}

impl RequestAssembler {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed one line (with or without its line ending). Returns a complete
    /// request when the line is the exchange terminator.
    pub fn feed(&mut self, line: &str) -> Option<PolicyRequest> {
        let line = line.trim_end_matches(['\n', '\r']);
        if !line.is_empty() {
            self.buffer.push(line.to_string());
            return None;
        }

        let request = parse_attributes(self.buffer.iter().map(String::as_str));
        self.buffer.clear();
        Some(request)
    }

    /// Number of lines waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop an unterminated trailing fragment, returning how many lines it had.
    pub fn discard(&mut self) -> usize {
        let n = self.buffer.len();
        self.buffer.clear();
        n
    }
}

impl Default for RequestAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Split each line on its first `=`. Lines without `=` and attributes whose
/// value is empty after trimming are dropped.
pub fn parse_attributes<'a>(lines: impl IntoIterator<Item = &'a str>) -> PolicyRequest {
    let mut request = PolicyRequest::new();
    for line in lines {
        let Some((key, value)) = line.split_once('=') else { continue };
        let value = value.trim();
        if value.is_empty() { continue; }
        request.insert(key, value);
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(assembler: &mut RequestAssembler, input: &str) -> Vec<PolicyRequest> {
        input
            .split_inclusive('\n')
            .filter_map(|line| assembler.feed(line))
            .collect()
    }

    #[test]
    fn two_exchanges_yield_two_requests() {
        let mut assembler = RequestAssembler::new();
        let requests = feed_all(&mut assembler, "a=1\n\nb=2\n\n");

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].iter().collect::<Vec<_>>(), vec![("a", "1")]);
        assert_eq!(requests[1].iter().collect::<Vec<_>>(), vec![("b", "2")]);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn unterminated_trailing_fragment_is_not_a_request() {
        let mut assembler = RequestAssembler::new();
        let requests = feed_all(&mut assembler, "a=1\n\nsasl_username=me\nclient_address=1.2.3.4\n");

        assert_eq!(requests.len(), 1);
        assert_eq!(assembler.pending(), 2);
        assert_eq!(assembler.discard(), 2);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn malformed_and_empty_attributes_are_dropped() {
        let mut assembler = RequestAssembler::new();
        let requests = feed_all(
            &mut assembler,
            "no_equals_here\nsasl_username=\nclient_address= 1.2.3.4 \nencoded=a=b\n\n",
        );

        let request = &requests[0];
        assert_eq!(request.len(), 2);
        assert_eq!(request.sasl_username(), "");
        assert_eq!(request.client_address(), "1.2.3.4");
        assert_eq!(request.get("encoded"), Some("a=b"));
    }

    #[test]
    fn crlf_terminated_lines_are_accepted() {
        let mut assembler = RequestAssembler::new();
        let requests = feed_all(&mut assembler, "sasl_username=me@example.tld\r\n\r\n");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].sasl_username(), "me@example.tld");
    }

    #[test]
    fn postfix_exchange_keeps_unrecognised_attributes() {
        let input = "request=smtpd_access_policy\nprotocol_state=RCPT\nprotocol_name=SMTP\n\
                     helo_name=some.domain.tld\nqueue_id=8045F2AB23\nsender=foo@bar.tld\n\
                     recipient=bar@foo.tld\nrecipient_count=0\nclient_address=1.2.3.4\n\
                     client_name=another.domain.tld\nreverse_client_name=another.domain.tld\n\
                     instance=123.456.7\n\n";
        let mut assembler = RequestAssembler::new();
        let requests = feed_all(&mut assembler, input);

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].len(), 12);
        assert_eq!(requests[0].get("queue_id"), Some("8045F2AB23"));
        assert_eq!(requests[0].sasl_username(), "");
    }
}
