//! SDP rewriting applied to every local description before it is set.

use once_cell::sync::Lazy;
use regex::Regex;

static RTPMAP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^a=rtpmap:(\d+) ([^/\s]+)/").expect("valid rtpmap regex"));
static MLINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^m=(\w+) ").expect("valid m-line regex"));

/// Shaping parameters applied identically to offers and answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpShaping {
    /// Encoding name as it appears in `a=rtpmap`, e.g. `H264` or `VP8`.
    pub preferred_video_codec: Option<String>,
    pub audio_max_kbps: Option<u32>,
    pub video_max_kbps: Option<u32>,
}

impl SdpShaping {
    pub fn apply(&self, sdp: &str) -> String {
        let sdp = match &self.preferred_video_codec {
            Some(codec) => prefer_video_codec(sdp, codec),
            None => sdp.to_string(),
        };
        apply_bandwidth_limits(&sdp, self.audio_max_kbps, self.video_max_kbps)
    }
}

struct Lines<'a> {
    lines: Vec<&'a str>,
    eol: &'static str,
    trailing_eol: bool,
}

impl<'a> Lines<'a> {
    fn split(sdp: &'a str) -> Self {
        let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
        let trailing_eol = sdp.ends_with('\n');
        let body = sdp.strip_suffix(eol).unwrap_or(sdp);
        let lines = body
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .collect();
        Self {
            lines,
            eol,
            trailing_eol,
        }
    }

    fn join(self, lines: Vec<String>) -> String {
        let mut out = lines.join(self.eol);
        if self.trailing_eol {
            out.push_str(self.eol);
        }
        out
    }

    /// Index ranges `[start, end)` of each media section, with its media kind.
    fn sections(&self) -> Vec<(String, usize, usize)> {
        let starts: Vec<(usize, String)> = self
            .lines
            .iter()
            .enumerate()
            .filter_map(|(i, line)| {
                MLINE_RE
                    .captures(line)
                    .map(|caps| (i, caps[1].to_ascii_lowercase()))
            })
            .collect();
        starts
            .iter()
            .enumerate()
            .map(|(n, (start, kind))| {
                let end = starts
                    .get(n + 1)
                    .map(|(next, _)| *next)
                    .unwrap_or(self.lines.len());
                (kind.clone(), *start, end)
            })
            .collect()
    }
}

/// Moves the payload types of `codec` to the front of every `m=video` line.
///
/// Other payload types keep their relative order. The SDP is returned
/// unchanged when the codec isn't offered.
pub fn prefer_video_codec(sdp: &str, codec: &str) -> String {
    let lines = Lines::split(sdp);
    let mut out: Vec<String> = lines.lines.iter().map(|l| l.to_string()).collect();

    for (kind, start, end) in lines.sections() {
        if kind != "video" {
            continue;
        }
        let preferred: Vec<&str> = lines.lines[start..end]
            .iter()
            .filter_map(|line| RTPMAP_RE.captures(line))
            .filter(|caps| caps[2].eq_ignore_ascii_case(codec))
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect();
        if preferred.is_empty() {
            continue;
        }

        let fields: Vec<&str> = lines.lines[start].split(' ').collect();
        if fields.len() <= 3 {
            continue;
        }
        let (head, payloads) = fields.split_at(3);
        let reordered: Vec<&str> = payloads
            .iter()
            .copied()
            .filter(|pt| preferred.contains(pt))
            .chain(payloads.iter().copied().filter(|pt| !preferred.contains(pt)))
            .collect();
        out[start] = head
            .iter()
            .chain(reordered.iter())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
    }

    lines.join(out)
}

/// Writes `b=AS:<kbps>` into the audio and video sections.
///
/// Existing `b=AS` lines in those sections are replaced. The new line goes
/// after the section's `c=` line, or right after the `m=` line when there is none.
pub fn apply_bandwidth_limits(
    sdp: &str,
    audio_kbps: Option<u32>,
    video_kbps: Option<u32>,
) -> String {
    let lines = Lines::split(sdp);
    let sections = lines.sections();
    let mut out: Vec<String> = Vec::with_capacity(lines.lines.len() + 2);

    let session_end = sections
        .first()
        .map(|(_, start, _)| *start)
        .unwrap_or(lines.lines.len());
    out.extend(lines.lines[..session_end].iter().map(|l| l.to_string()));

    for (kind, start, end) in &sections {
        let limit = match kind.as_str() {
            "audio" => audio_kbps,
            "video" => video_kbps,
            _ => None,
        };
        let section = &lines.lines[*start..*end];
        let Some(kbps) = limit else {
            out.extend(section.iter().map(|l| l.to_string()));
            continue;
        };

        let insert_after = section
            .iter()
            .position(|line| line.starts_with("c="))
            .unwrap_or(0);
        for (i, line) in section.iter().enumerate() {
            if line.starts_with("b=AS:") {
                continue;
            }
            out.push(line.to_string());
            if i == insert_after {
                out.push(format!("b=AS:{kbps}"));
            }
        }
    }

    lines.join(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtpmap:0 PCMU/8000\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 102 103 98\r\n\
c=IN IP4 0.0.0.0\r\n\
b=AS:2000\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=rtpmap:102 H264/90000\r\n\
a=rtpmap:103 rtx/90000\r\n\
a=rtpmap:98 h264/90000\r\n";

    #[test]
    fn preferred_codec_moves_to_front_keeping_order() {
        let shaped = prefer_video_codec(OFFER, "H264");
        assert!(shaped.contains("m=video 9 UDP/TLS/RTP/SAVPF 102 98 96 97 103\r\n"));
        assert!(shaped.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n"));
        assert!(shaped.ends_with("\r\n"));
        assert_eq!(shaped.lines().count(), OFFER.lines().count());
    }

    #[test]
    fn missing_codec_leaves_sdp_untouched() {
        assert_eq!(prefer_video_codec(OFFER, "AV1"), OFFER);
    }

    #[test]
    fn bandwidth_lines_follow_connection_line() {
        let shaped = apply_bandwidth_limits(OFFER, Some(48), Some(900));
        assert!(shaped.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\nc=IN IP4 0.0.0.0\r\nb=AS:48\r\n"));
        assert!(shaped.contains("c=IN IP4 0.0.0.0\r\nb=AS:900\r\na=rtpmap:96"));
        assert!(!shaped.contains("b=AS:2000"));
        assert_eq!(shaped.matches("b=AS:").count(), 2);
    }

    #[test]
    fn bandwidth_without_connection_line_goes_after_mline() {
        let sdp = "v=0\nm=video 9 RTP/AVP 96\na=rtpmap:96 VP8/90000\n";
        let shaped = apply_bandwidth_limits(sdp, None, Some(500));
        assert_eq!(
            shaped,
            "v=0\nm=video 9 RTP/AVP 96\nb=AS:500\na=rtpmap:96 VP8/90000\n"
        );
    }

    #[test]
    fn shaping_is_idempotent() {
        let shaping = SdpShaping {
            preferred_video_codec: Some("H264".into()),
            audio_max_kbps: Some(48),
            video_max_kbps: Some(900),
        };
        let once = shaping.apply(OFFER);
        assert_eq!(shaping.apply(&once), once);
    }
}
