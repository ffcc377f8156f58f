use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize, specs::server::ServerSpec};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR: Header = 0;
const CONTROL: Header = 1;
const GRADIENT: Header = 2;
const MODEL: Header = 3;
const SPARSE_GRADIENT: Header = 4;
const LEARNING_RATE: Header = 5;

const SENDER_SIZE: usize = size_of::<u32>();
const VERSION_SIZE: usize = size_of::<u64>();
const LR_SIZE: usize = size_of::<f32>();
const COUNT_SIZE: usize = size_of::<u32>();

/// The longest body a data frame may have for a model of `params` parameters.
///
/// The bound is set by a sparse gradient carrying every coordinate, which is longer than any
/// dense payload of the same model.
pub fn max_frame_len(params: usize) -> usize {
    HEADER_SIZE
        + SENDER_SIZE
        + VERSION_SIZE
        + LR_SIZE
        + COUNT_SIZE
        + params * (size_of::<u32>() + size_of::<f32>())
}

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug, PartialEq)]
pub enum Payload<'a> {
    /// A dense gradient pushed by a worker.
    Gradient(&'a [f32]),
    /// A full model snapshot pushed by the server.
    Model(&'a [f32]),
    /// A sparse gradient in either direction, the server fills `lr` on its replies.
    SparseGradient {
        lr: f32,
        indices: &'a [u32],
        values: &'a [f32],
    },
    /// A new global learning rate.
    LearningRate(f32),
}

impl Payload<'_> {
    /// The name of this payload's kind, used for error reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Gradient(_) => "GradientUpdate",
            Payload::Model(_) => "ModelUpdate",
            Payload::SparseGradient { .. } => "SparseGradientUpdate",
            Payload::LearningRate(_) => "LearningRate",
        }
    }
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Connect,
    CreateServer(ServerSpec),
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data {
        sender: u32,
        version: u64,
        payload: Payload<'a>,
    },
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    fn buf_is_too_small<T>(size: usize, needed: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {needed} bytes"),
        ))
    }

    fn invalid_kind_byte<T>(byte: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind byte {byte}"),
        ))
    }
}

/// Splits `n` bytes off the front of `buf`.
fn take<'a>(buf: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    if buf.len() < n {
        return Msg::buf_is_too_small(buf.len(), n);
    }

    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

fn take_array<const N: usize>(buf: &mut &[u8]) -> io::Result<[u8; N]> {
    let bytes = take(buf, N)?;
    let mut out = [0; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn cast<'a, T: bytemuck::Pod>(bytes: &'a [u8]) -> io::Result<&'a [T]> {
    bytemuck::try_cast_slice(bytes).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received a malformed numeric array: {err:?}"),
        )
    })
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());

                // SAFETY: Serialize impl for `Command` is derived and not implemented
                //         by hand. Nor has a non string-key map inside.
                serde_json::to_writer(buf, &cmd).unwrap();
                None
            }
            Msg::Data {
                sender,
                version,
                payload,
            } => {
                let kind = match payload {
                    Payload::Gradient(_) => GRADIENT,
                    Payload::Model(_) => MODEL,
                    Payload::SparseGradient { .. } => SPARSE_GRADIENT,
                    Payload::LearningRate(_) => LEARNING_RATE,
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                buf.extend_from_slice(&sender.to_be_bytes());
                buf.extend_from_slice(&version.to_be_bytes());

                match payload {
                    Payload::Gradient(nums) | Payload::Model(nums) => {
                        Some(bytemuck::cast_slice(*nums))
                    }
                    Payload::SparseGradient {
                        lr,
                        indices,
                        values,
                    } => {
                        buf.extend_from_slice(&lr.to_be_bytes());
                        buf.extend_from_slice(&(indices.len() as u32).to_be_bytes());
                        buf.extend_from_slice(bytemuck::cast_slice(*indices));
                        Some(bytemuck::cast_slice(*values))
                    }
                    Payload::LearningRate(lr) => {
                        buf.extend_from_slice(&lr.to_be_bytes());
                        None
                    }
                }
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let mut rest = buf;
        let kind = Header::from_be_bytes(take_array::<HEADER_SIZE>(&mut rest)?);

        match kind {
            ERR => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            GRADIENT..=LEARNING_RATE => {
                let sender = u32::from_be_bytes(take_array::<SENDER_SIZE>(&mut rest)?);
                let version = u64::from_be_bytes(take_array::<VERSION_SIZE>(&mut rest)?);

                let payload = match kind {
                    GRADIENT => Payload::Gradient(cast(rest)?),
                    MODEL => Payload::Model(cast(rest)?),
                    SPARSE_GRADIENT => {
                        let lr = f32::from_be_bytes(take_array::<LR_SIZE>(&mut rest)?);
                        let k = u32::from_be_bytes(take_array::<COUNT_SIZE>(&mut rest)?) as usize;

                        let indices = cast(take(&mut rest, k * size_of::<u32>())?)?;
                        let values: &[f32] = cast(rest)?;

                        if values.len() != k {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("Expected {k} sparse values, got {}", values.len()),
                            ));
                        }

                        Payload::SparseGradient {
                            lr,
                            indices,
                            values,
                        }
                    }
                    _ => Payload::LearningRate(f32::from_be_bytes(take_array::<LR_SIZE>(
                        &mut rest,
                    )?)),
                };

                Ok(Self::Data {
                    sender,
                    version,
                    payload,
                })
            }
            byte => Self::invalid_kind_byte(byte),
        }
    }
}
