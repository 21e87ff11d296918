use bytes::{Bytes, BytesMut};

pub const DONE: &[u8] = b"[DONE]";

/// One event out of an SSE byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
	/// The payload of a `data:` line (joined across continuation lines).
	Data(Bytes),
	/// The terminal `data: [DONE]` marker.
	Done,
}

/// Incremental SSE frame splitter. Feed raw bytes as they arrive from the
/// upstream socket; events are yielded once their blank-line terminator is
/// seen, regardless of how the bytes were chunked. Comment lines and event
/// name/id fields are skipped: adapters only consume the data payload.
#[derive(Default)]
pub struct FrameParser {
	buf: BytesMut,
}

impl FrameParser {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
	}

	/// Next complete event, if the buffer holds one.
	pub fn next_frame(&mut self) -> Option<Frame> {
		loop {
			let boundary = find_event_boundary(&self.buf)?;
			let raw = self.buf.split_to(boundary.end);
			let event = &raw[..boundary.start];
			let mut data: Option<BytesMut> = None;
			for line in event.split(|&b| b == b'\n') {
				let line = line.strip_suffix(b"\r").unwrap_or(line);
				let Some(rest) = line.strip_prefix(b"data:") else {
					continue;
				};
				let rest = rest.strip_prefix(b" ").unwrap_or(rest);
				match data.as_mut() {
					Some(d) => {
						d.extend_from_slice(b"\n");
						d.extend_from_slice(rest);
					},
					None => data = Some(BytesMut::from(rest)),
				}
			}
			match data {
				Some(d) if d.as_ref() == DONE => return Some(Frame::Done),
				Some(d) => return Some(Frame::Data(d.freeze())),
				// Comment-only or field-only event; keep scanning.
				None => continue,
			}
		}
	}
}

struct Boundary {
	/// Length of the event content.
	start: usize,
	/// Length including the blank-line terminator.
	end: usize,
}

fn find_event_boundary(buf: &[u8]) -> Option<Boundary> {
	// Events end at a blank line: \n\n or \r\n\r\n.
	let mut i = 0;
	while i + 1 < buf.len() {
		if buf[i] == b'\n' {
			if buf[i + 1] == b'\n' {
				return Some(Boundary {
					start: i + 1,
					end: i + 2,
				});
			}
			if i + 3 <= buf.len() && &buf[i + 1..i + 3] == b"\r\n" {
				return Some(Boundary {
					start: i + 1,
					end: i + 3,
				});
			}
		}
		i += 1;
	}
	None
}

/// Encode one JSON payload as an SSE data frame.
pub fn data_frame(json: &[u8]) -> Bytes {
	let mut out = BytesMut::with_capacity(json.len() + 8);
	out.extend_from_slice(b"data: ");
	out.extend_from_slice(json);
	out.extend_from_slice(b"\n\n");
	out.freeze()
}

/// The terminal frame of an OpenAI-compatible stream.
pub fn done_frame() -> Bytes {
	Bytes::from_static(b"data: [DONE]\n\n")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn collect(parser: &mut FrameParser) -> Vec<Frame> {
		let mut frames = Vec::new();
		while let Some(f) = parser.next_frame() {
			frames.push(f);
		}
		frames
	}

	#[test]
	fn single_event() {
		let mut p = FrameParser::new();
		p.push(b"data: {\"a\":1}\n\n");
		assert_eq!(
			collect(&mut p),
			vec![Frame::Data(Bytes::from_static(b"{\"a\":1}"))]
		);
	}

	#[test]
	fn event_split_across_pushes() {
		let mut p = FrameParser::new();
		p.push(b"data: {\"a\"");
		assert!(p.next_frame().is_none());
		p.push(b":1}\n");
		assert!(p.next_frame().is_none());
		p.push(b"\n");
		assert_eq!(
			collect(&mut p),
			vec![Frame::Data(Bytes::from_static(b"{\"a\":1}"))]
		);
	}

	#[test]
	fn multiple_events_in_one_push() {
		let mut p = FrameParser::new();
		p.push(b"data: 1\n\ndata: 2\n\ndata: [DONE]\n\n");
		assert_eq!(
			collect(&mut p),
			vec![
				Frame::Data(Bytes::from_static(b"1")),
				Frame::Data(Bytes::from_static(b"2")),
				Frame::Done,
			]
		);
	}

	#[test]
	fn named_events_and_comments_skipped() {
		let mut p = FrameParser::new();
		p.push(b": keep-alive\n\nevent: message_start\ndata: {\"x\":1}\n\n");
		assert_eq!(
			collect(&mut p),
			vec![Frame::Data(Bytes::from_static(b"{\"x\":1}"))]
		);
	}

	#[test]
	fn crlf_line_endings() {
		let mut p = FrameParser::new();
		p.push(b"data: hi\r\n\r\n");
		assert_eq!(collect(&mut p), vec![Frame::Data(Bytes::from_static(b"hi"))]);
	}

	#[test]
	fn multi_line_data_joined() {
		let mut p = FrameParser::new();
		p.push(b"data: line1\ndata: line2\n\n");
		assert_eq!(
			collect(&mut p),
			vec![Frame::Data(Bytes::from_static(b"line1\nline2"))]
		);
	}

	#[test]
	fn frame_encoding_round_trip() {
		let frame = data_frame(b"{\"ok\":true}");
		let mut p = FrameParser::new();
		p.push(&frame);
		p.push(&done_frame());
		assert_eq!(
			collect(&mut p),
			vec![Frame::Data(Bytes::from_static(b"{\"ok\":true}")), Frame::Done]
		);
	}
}
