// NETASCII line-ending transcoding.
//
// On the wire every line ends in <CR><LF> and a carriage return that does not start a line
// ending is sent as <CR><NUL> (RFC 764). Locally, lines end in whatever the host uses.
//
// Going to the wire is stateless per byte. Coming from the wire is not: a <CR> at the end of
// one DATA block may be the first half of a line ending whose <LF> arrives in the next block,
// so the decoder carries one bit of lookahead across calls. Each transfer owns its own coder.

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0x00;

/// The line terminator convention of local files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    /// The host's own convention.
    pub fn native() -> LineEnding {
        if cfg!(windows) {
            LineEnding::CrLf
        } else {
            LineEnding::Lf
        }
    }

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            LineEnding::Lf => b"\n",
            LineEnding::CrLf => b"\r\n",
        }
    }
}

impl Default for LineEnding {
    fn default() -> LineEnding {
        LineEnding::native()
    }
}

/// Converts local text into NETASCII.
#[derive(Debug, Clone)]
pub struct Encoder {
    local: LineEnding,
}

impl Encoder {
    pub fn new(local: LineEnding) -> Encoder {
        Encoder { local }
    }

    /// Appends the NETASCII form of `input` to `out`.
    pub fn encode(&self, input: &[u8], out: &mut Vec<u8>) {
        match self.local {
            // Already the wire convention.
            LineEnding::CrLf => out.extend_from_slice(input),
            LineEnding::Lf => {
                out.reserve(input.len());
                for &b in input {
                    match b {
                        LF => out.extend_from_slice(&[CR, LF]),
                        CR => out.extend_from_slice(&[CR, NUL]),
                        _ => out.push(b),
                    }
                }
            }
        }
    }
}

/// Converts NETASCII into local text, one chunk at a time.
#[derive(Debug, Clone)]
pub struct Decoder {
    local: LineEnding,
    pending_cr: bool,
}

impl Decoder {
    pub fn new(local: LineEnding) -> Decoder {
        Decoder { local, pending_cr: false }
    }

    /// Appends the local form of `input` to `out`. A trailing <CR> is held back until the next
    /// call, or until [`Decoder::finish`].
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len());
        for &b in input {
            if self.pending_cr {
                self.pending_cr = false;
                match b {
                    LF => {
                        out.extend_from_slice(self.local.as_bytes());
                        continue;
                    }
                    NUL => {
                        out.push(CR);
                        continue;
                    }
                    _ => out.push(CR),
                }
            }

            if b == CR {
                self.pending_cr = true;
            } else {
                out.push(b);
            }
        }
    }

    /// Flushes a <CR> still waiting for its lookahead. It was not part of a line ending.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if self.pending_cr {
            self.pending_cr = false;
            out.push(CR);
        }
    }
}
