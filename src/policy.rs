use crate::segment::ParsedSegment;

// ==========================================
// Interception policy (what to grab, what to answer)
// ==========================================
// Both halves are injected values; the engine itself has no opinion about
// what a "targeted request" looks like.

/// Decides whether an outbound request segment should be intercepted.
pub trait Matcher {
    fn matches(&self, segment: &ParsedSegment) -> bool;
}

/// Produces the complete substitute application payload for a hit.
pub trait Responder {
    fn build(&self, segment: &ParsedSegment) -> Vec<u8>;
}

/// Matches any payload containing the configured marker bytes
/// (e.g. b".exe" anywhere in the request line).
pub struct MarkerMatcher {
    marker: Vec<u8>,
}

impl MarkerMatcher {
    pub fn new(marker: impl Into<Vec<u8>>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl Matcher for MarkerMatcher {
    fn matches(&self, segment: &ParsedSegment) -> bool {
        let payload = segment.payload();
        if self.marker.is_empty() || payload.len() < self.marker.len() {
            return false;
        }
        payload.windows(self.marker.len()).any(|w| w == self.marker)
    }
}

/// Answers every hit with a fixed `301 Moved Permanently` pointing the
/// client at the substitute resource.
pub struct RedirectResponder {
    template: Vec<u8>,
}

impl RedirectResponder {
    pub fn new(location: &str) -> Self {
        let template =
            format!("HTTP/1.1 301 Moved Permanently\r\nLocation: {location}\r\n\r\n").into_bytes();
        Self { template }
    }
}

impl Responder for RedirectResponder {
    fn build(&self, _segment: &ParsedSegment) -> Vec<u8> {
        self.template.clone()
    }
}
