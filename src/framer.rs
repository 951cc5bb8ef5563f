//! The stream framer: bytes in, whole frames out.
//!
//! A [`Framer`] wraps one [`Structure`] and an internal buffer. Each
//! [`Framer::feed`] appends input and then delivers every complete frame
//! it can, in stream order, to the frame callback. When the structure
//! opens with a magic field, the framer hunts for that prefix and skips
//! garbage in between frames; parse failures are reported through the
//! event callback and recovered from by discarding one byte and hunting
//! again.
//!
//! Framing requires the total frame length to be determinable from a
//! bounded prefix of the frame (a greedy tail with no length field ahead
//! of it cannot be delimited in a stream); [`Framer::new`] rejects
//! structures where it is not.

use crate::error::{DeclarationError, Error, ErrorKind};
use crate::field::{FieldKind, SizeMode};
use crate::structure::unpack::{provider_value, region_len};
use crate::structure::{Structure, base_kind, condition_holds};
use crate::value::{Record, Value};

/// A diagnostic delivered through the framer's event callback.
#[derive(Debug, PartialEq)]
pub enum FramerEvent {
    /// Bytes were skipped while hunting for the magic prefix or
    /// resynchronizing after an error.
    Discarded(usize),
    /// A frame failed to parse; the framer resynchronizes afterwards.
    FrameError(Error),
}

#[derive(Clone, Copy, Debug)]
enum State {
    Hunt,
    Sizing,
    Drain(usize),
    Fatal(usize),
}

/// Incremental frame recovery over a byte stream.
///
/// ```
/// use valise::field::FieldKind;
/// use valise::framer::Framer;
/// use valise::scalar::Scalar;
/// use valise::structure::Structure;
///
/// let frame = Structure::builder("frame")
///     .field("magic", FieldKind::magic(b"\xAA\x55"))
///     .field("len", FieldKind::length(Scalar::u8()))
///     .field("body", FieldKind::sized_payload("len"))
///     .build()?;
///
/// let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
/// let sink = seen.clone();
/// let mut framer = Framer::new(frame, move |frame| sink.borrow_mut().push(frame))?;
/// framer.feed(&[0xAA, 0x55, 0x01])?;
/// assert!(seen.borrow().is_empty()); // body byte still missing
/// framer.feed(&[0x42])?;
/// assert_eq!(seen.borrow().len(), 1);
/// # Ok::<(), valise::error::Error>(())
/// ```
pub struct Framer {
    layout: Structure,
    on_frame: Box<dyn FnMut(Record)>,
    on_event: Option<Box<dyn FnMut(FramerEvent)>>,
    buffer: Vec<u8>,
    state: State,
    magic: Option<Vec<u8>>,
    max_buffer: Option<usize>,
    discarded: usize,
}

impl std::fmt::Debug for Framer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framer")
            .field("layout", &self.layout)
            .field("buffer", &self.buffer)
            .field("state", &self.state)
            .field("magic", &self.magic)
            .field("max_buffer", &self.max_buffer)
            .field("discarded", &self.discarded)
            .finish_non_exhaustive()
    }
}

impl Framer {
    /// Wrap `layout`, delivering each parsed frame to `on_frame`.
    ///
    /// Fails with `UnsizableFrame` when the structure's total length is not
    /// determinable from a bounded prefix.
    pub fn new(layout: Structure, on_frame: impl FnMut(Record) + 'static) -> Result<Self, Error> {
        if !layout.meta().sizable || layout.fixed_width() == Some(0) {
            return Err(DeclarationError::UnsizableFrame(layout.name().into()).into());
        }
        let magic = match layout.slots().first().map(|slot| base_kind(&slot.kind)) {
            Some(FieldKind::Magic(constant)) if !constant.is_empty() => Some(constant.clone()),
            _ => None,
        };
        let state = if magic.is_some() { State::Hunt } else { State::Sizing };
        Ok(Self {
            layout,
            on_frame: Box::new(on_frame),
            on_event: None,
            buffer: Vec::new(),
            state,
            magic,
            max_buffer: None,
            discarded: 0,
        })
    }

    /// Install a callback for skipped bytes and per-frame parse errors.
    pub fn with_event_handler(mut self, on_event: impl FnMut(FramerEvent) + 'static) -> Self {
        self.on_event = Some(Box::new(on_event));
        self
    }

    /// Cap the internal buffer at `limit` bytes. Exceeding the cap (for
    /// example, a producer that withholds the sync magic forever) is fatal.
    pub fn with_max_buffer(mut self, limit: usize) -> Self {
        self.max_buffer = Some(limit);
        self
    }

    /// True once the framer has shut down after exceeding its buffer cap.
    pub fn is_fatal(&self) -> bool {
        matches!(self.state, State::Fatal(_))
    }

    /// Append `bytes` and deliver every frame that is now complete.
    ///
    /// Returns only after processing everything it can; per-frame parse
    /// errors go to the event callback, while exceeding the buffer cap is
    /// returned as `FramerOverflow` and shuts the framer down.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if let State::Fatal(limit) = self.state {
            return Err(ErrorKind::FramerOverflow { limit }.into());
        }
        self.buffer.extend_from_slice(bytes);
        loop {
            let advanced = match self.state {
                State::Hunt => self.hunt(),
                State::Sizing => self.size(),
                State::Drain(total) => self.drain(total),
                State::Fatal(_) => false,
            };
            if !advanced {
                break;
            }
        }
        if let Some(limit) = self.max_buffer {
            if self.buffer.len() > limit {
                self.state = State::Fatal(limit);
                return Err(ErrorKind::FramerOverflow { limit }.into());
            }
        }
        Ok(())
    }

    /// Scan for the magic prefix, dropping everything before it.
    fn hunt(&mut self) -> bool {
        let magic = self.magic.as_ref().expect("hunting requires a magic prefix");
        let found = self.buffer.windows(magic.len()).position(|window| window == magic.as_slice());
        match found {
            Some(position) => {
                self.discarded += position;
                self.buffer.drain(..position);
                self.flush_discarded();
                self.state = State::Sizing;
                true
            }
            None => {
                // keep a partial magic at the tail for the next feed
                let keep = magic.len().saturating_sub(1).min(self.buffer.len());
                let dropped = self.buffer.len() - keep;
                self.discarded += dropped;
                self.buffer.drain(..dropped);
                false
            }
        }
    }

    /// Trial-decode the prefix until the total frame length is known.
    fn size(&mut self) -> bool {
        match measure(&self.layout, &self.buffer) {
            Ok(Some(total)) => {
                self.flush_discarded();
                self.state = State::Drain(total);
                true
            }
            Ok(None) => false,
            Err(err) => {
                self.report(FramerEvent::FrameError(err));
                self.resync();
                true
            }
        }
    }

    /// Wait for `total` bytes, then parse and deliver exactly that slice.
    fn drain(&mut self, total: usize) -> bool {
        if self.buffer.len() < total {
            return false;
        }
        match self.layout.unpack(&self.buffer[..total]) {
            Ok(frame) => {
                self.buffer.drain(..total);
                self.state = self.initial_state();
                (self.on_frame)(frame);
                true
            }
            Err(err) => {
                self.report(FramerEvent::FrameError(err));
                self.resync();
                true
            }
        }
    }

    /// Discard one byte and go back to looking for a frame start.
    fn resync(&mut self) {
        if !self.buffer.is_empty() {
            self.buffer.drain(..1);
            self.discarded += 1;
        }
        self.state = self.initial_state();
    }

    fn initial_state(&self) -> State {
        if self.magic.is_some() { State::Hunt } else { State::Sizing }
    }

    fn flush_discarded(&mut self) {
        if self.discarded > 0 {
            let count = self.discarded;
            self.discarded = 0;
            self.report(FramerEvent::Discarded(count));
        }
    }

    fn report(&mut self, event: FramerEvent) {
        if let Some(handler) = self.on_event.as_mut() {
            handler(event);
        }
    }
}

/// Determine the total frame length from the front of `buffer`.
///
/// Decodes fixed fields into a scratch record so that providers,
/// dispatch keys, and presence conditions resolve; bounded regions are
/// skipped without looking inside (their content is parsed in the drain
/// step). `Ok(None)` means more bytes are needed.
fn measure(layout: &Structure, buffer: &[u8]) -> Result<Option<usize>, Error> {
    measure_region(layout, buffer, 0)
}

fn measure_region(layout: &Structure, region: &[u8], base: usize) -> Result<Option<usize>, Error> {
    let mut record = Record::new(layout);
    let mut cursor = 0usize;

    for index in 0..layout.slot_count() {
        let name = layout.slot_name(index);
        let at = base + cursor;
        if !condition_holds(layout, index, &record).map_err(|err| err.at_offset(at))? {
            continue;
        }
        let remaining = region.len() - cursor;

        match base_kind(&layout.slots()[index].kind) {
            FieldKind::Scalar(_)
            | FieldKind::Length { .. }
            | FieldKind::Dispatch { .. }
            | FieldKind::Derived { .. } => {
                let scalar = layout.slot_scalar(index).expect("scalar-like slots carry a scalar");
                if remaining < scalar.width() {
                    return Ok(None);
                }
                let (value, used) = scalar
                    .decode(&region[cursor..])
                    .map_err(|kind| Error::new(kind).at_offset(at).in_field(name))?;
                record.set_slot(index, value);
                cursor += used;
            }
            FieldKind::FixedBytes(len) => {
                if remaining < *len {
                    return Ok(None);
                }
                record.set_slot(index, Value::Bytes(region[cursor..cursor + len].to_vec()));
                cursor += len;
            }
            FieldKind::Magic(constant) => {
                if remaining < constant.len() {
                    return Ok(None);
                }
                let got = &region[cursor..cursor + constant.len()];
                if got != constant.as_slice() {
                    return Err(Error::new(ErrorKind::MagicMismatch {
                        expected: constant.clone(),
                        got: got.to_vec(),
                    })
                    .at_offset(at)
                    .in_field(name));
                }
                record.set_slot(index, Value::Bytes(constant.clone()));
                cursor += constant.len();
            }
            FieldKind::Bits(bit_layout) => {
                if remaining < bit_layout.width_bytes() {
                    return Ok(None);
                }
                let (values, used) = bit_layout
                    .unpack(&region[cursor..])
                    .map_err(|err| err.at_offset(at).in_field(name))?;
                record.set_slot(index, Value::Bits(values));
                cursor += used;
            }
            FieldKind::Payload { .. } => {
                let Some(len) = bounded_len(layout, &record, index, remaining, at)? else {
                    return Ok(None);
                };
                record.set_slot(index, Value::Bytes(region[cursor..cursor + len].to_vec()));
                cursor += len;
            }
            FieldKind::Substruct { layout: inner, .. } => {
                if layout.slot_width(index).is_some() || layout.meta().size_refs[index].is_some() {
                    let Some(len) = bounded_len(layout, &record, index, remaining, at)? else {
                        return Ok(None);
                    };
                    cursor += len;
                } else {
                    match measure_region(inner, &region[cursor..], at)
                        .map_err(|err| err.in_field(name))?
                    {
                        Some(len) => cursor += len,
                        None => return Ok(None),
                    }
                }
            }
            FieldKind::Target { arms, fallback, .. } => {
                if layout.meta().size_refs[index].is_some() {
                    let Some(len) = bounded_len(layout, &record, index, remaining, at)? else {
                        return Ok(None);
                    };
                    cursor += len;
                } else {
                    let select = layout.meta().select_refs[index]
                        .as_ref()
                        .expect("targets resolve a selector");
                    let key = provider_value(layout, &record, select, at)?;
                    let arm = arms
                        .iter()
                        .find(|(arm_key, _)| *arm_key == key)
                        .map(|(_, arm)| arm)
                        .or(fallback.as_ref())
                        .ok_or_else(|| {
                            Error::new(ErrorKind::UnknownDispatch(key)).at_offset(at).in_field(name)
                        })?;
                    match measure_region(arm, &region[cursor..], at)
                        .map_err(|err| err.in_field(name))?
                    {
                        Some(len) => cursor += len,
                        None => return Ok(None),
                    }
                }
            }
            FieldKind::Array { element, mode, .. } => match mode {
                SizeMode::Count => {
                    let provider = layout.meta().size_refs[index]
                        .as_ref()
                        .expect("counted arrays resolve a provider");
                    let count = provider_value(layout, &record, provider, at)?;
                    for _ in 0..count {
                        match measure_region(element, &region[cursor..], base + cursor)
                            .map_err(|err| err.in_field(name))?
                        {
                            Some(0) => {
                                return Err(Error::new(ErrorKind::ArrayElementUnderflow {
                                    leftover: region.len() - cursor,
                                })
                                .at_offset(base + cursor)
                                .in_field(name));
                            }
                            Some(used) => cursor += used,
                            None => return Ok(None),
                        }
                    }
                }
                SizeMode::Bytes => {
                    let Some(len) = bounded_len(layout, &record, index, remaining, at)? else {
                        return Ok(None);
                    };
                    cursor += len;
                }
            },
            FieldKind::Conditional { .. } => unreachable!("base_kind looks through conditionals"),
        }
    }

    Ok(Some(cursor))
}

/// [`region_len`] for the sizing walk: a short buffer means "wait for
/// more input" rather than an error.
fn bounded_len(
    layout: &Structure,
    record: &Record,
    index: usize,
    remaining: usize,
    at: usize,
) -> Result<Option<usize>, Error> {
    match region_len(layout, record, index, remaining, at) {
        Ok(len) => Ok(Some(len)),
        Err(err) if matches!(err.kind(), ErrorKind::ShortBuffer { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}
