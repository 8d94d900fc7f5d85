//! Weight file reading and writing.
//!
//! A weight file is a little-endian container:
//!
//! ```text
//! "NCHT" | u32 version | u32 config_len | config JSON
//! vocabulary section
//! tensor records, in manifest order
//! ```
//!
//! The vocabulary section is `u32 strategy, u32 n_vocab` followed by
//! `(u32 len, bytes, f32 score, u8 type)` per token, then `u32 n_merges`
//! and `(u32 len, "left right")` per merge. A tensor record is
//! `(u32 name_len, name, u32 ndim, u32 dims[ndim], u32 dtype, raw bytes)`
//! with dtype 0 = f32, 1 = f16, 2 = bf16.
//!
//! Loading is all-or-nothing: records must match the model's weight manifest
//! name for name and shape for shape, and the bytes consumed must equal the
//! file size. Anything else is [`Error::CorruptedWeights`].

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use memmap2::Mmap;
use tracing::info;

use super::transformer::{weight_manifest, Transformer};
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::tokenizer::{Processor, Strategy, TokenScore, TokenType, Vocab};

/// File magic.
pub const MAGIC: &[u8; 4] = b"NCHT";
/// Current format version.
pub const VERSION: u32 = 1;

const DTYPE_F32: u32 = 0;
const DTYPE_F16: u32 = 1;
const DTYPE_BF16: u32 = 2;

/// Everything read from a weight file.
#[derive(Debug)]
pub struct LoadedModel {
    pub config: ModelConfig,
    pub processor: Processor,
    pub model: Transformer,
}

/// Sequential reader over the mapped bytes; running past the end is corruption.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => {
                let bytes = &self.data[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(Error::CorruptedWeights(format!(
                "unexpected end of file: need {n} bytes at offset {}, file has {}",
                self.pos,
                self.data.len()
            ))),
        }
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Tokenization(format!("invalid UTF-8 at offset {}: {e}", self.pos)))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Convert F16 (IEEE 754 half-precision) bits to F32.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exp = u32::from((bits >> 10) & 0x1F);
    let mant = u32::from(bits & 0x3FF);

    match (exp, mant) {
        (0, 0) => f32::from_bits(sign),
        (0, _) => {
            // Subnormal: renormalize into the f32 exponent range
            let mut m = mant;
            let mut e = 0i32;
            while m & 0x400 == 0 {
                m <<= 1;
                e -= 1;
            }
            let exp = (127 - 15 + 1 + e) as u32;
            f32::from_bits(sign | (exp << 23) | ((m & 0x3FF) << 13))
        }
        (31, _) => f32::from_bits(sign | (0xFF << 23) | (mant << 13)),
        _ => f32::from_bits(sign | ((exp + 127 - 15) << 23) | (mant << 13)),
    }
}

fn decode_elements(bytes: &[u8], dtype: u32) -> Vec<f32> {
    match dtype {
        DTYPE_F16 => bytes
            .chunks_exact(2)
            .map(|b| f16_to_f32(u16::from_le_bytes([b[0], b[1]])))
            .collect(),
        DTYPE_BF16 => bytes
            .chunks_exact(2)
            .map(|b| f32::from_bits(u32::from(u16::from_le_bytes([b[0], b[1]])) << 16))
            .collect(),
        _ => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    }
}

fn read_header(reader: &mut ByteReader<'_>) -> Result<ModelConfig> {
    let magic = reader.take(4)?;
    if magic != MAGIC {
        return Err(Error::CorruptedWeights(format!("bad magic {magic:?}")));
    }
    let version = reader.u32()?;
    if version != VERSION {
        return Err(Error::CorruptedWeights(format!(
            "unsupported format version {version}"
        )));
    }
    let len = reader.u32()? as usize;
    let config: ModelConfig = serde_json::from_slice(reader.take(len)?)
        .map_err(|e| Error::CorruptedWeights(format!("config header: {e}")))?;
    config.validate()?;
    Ok(config)
}

fn read_vocab(reader: &mut ByteReader<'_>) -> Result<Processor> {
    let strategy = Strategy::from_tag(reader.u32()?)?;
    let n_vocab = reader.u32()? as usize;
    let mut tokens = Vec::with_capacity(n_vocab.min(reader.remaining()));
    for _ in 0..n_vocab {
        let piece = reader.string()?;
        let score = reader.f32()?;
        let kind = TokenType::try_from(reader.u8()?)?;
        tokens.push(TokenScore::new(piece, score, kind));
    }
    let n_merges = reader.u32()? as usize;
    let mut merges = Vec::with_capacity(n_merges.min(reader.remaining()));
    for _ in 0..n_merges {
        merges.push(Vocab::parse_merge(&reader.string()?)?);
    }
    Ok(Processor::new(strategy, Vocab::new(tokens).with_merges(merges)))
}

fn read_tensors(
    reader: &mut ByteReader<'_>,
    config: &ModelConfig,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    for (expected_name, expected_shape) in weight_manifest(config) {
        let name = reader.string().map_err(|e| match e {
            Error::Tokenization(msg) => Error::CorruptedWeights(msg),
            other => other,
        })?;
        if name != expected_name {
            return Err(Error::CorruptedWeights(format!(
                "expected tensor {expected_name}, found {name}"
            )));
        }
        let ndim = reader.u32()? as usize;
        let mut shape = Vec::with_capacity(ndim.min(8));
        for _ in 0..ndim {
            shape.push(reader.u32()? as usize);
        }
        if shape != expected_shape {
            return Err(Error::CorruptedWeights(format!(
                "tensor {name} has shape {shape:?}, expected {expected_shape:?}"
            )));
        }
        let dtype = reader.u32()?;
        let elem_size = match dtype {
            DTYPE_F32 => 4,
            DTYPE_F16 | DTYPE_BF16 => 2,
            other => {
                return Err(Error::CorruptedWeights(format!(
                    "tensor {name} has unknown dtype tag {other}"
                )))
            }
        };
        let count: usize = shape.iter().product();
        let bytes = reader.take(count * elem_size)?;
        let tensor = Tensor::from_vec(decode_elements(bytes, dtype), shape, device)?;
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

/// Parses a whole weight file from memory.
pub fn load_from_bytes(data: &[u8], dtype: DType, device: &Device) -> Result<LoadedModel> {
    let mut reader = ByteReader::new(data);
    let config = read_header(&mut reader)?;
    let processor = read_vocab(&mut reader)?;
    if processor.vocab().len() != config.vocab_size {
        return Err(Error::CorruptedWeights(format!(
            "vocabulary has {} entries, config says {}",
            processor.vocab().len(),
            config.vocab_size
        )));
    }
    let tensors = read_tensors(&mut reader, &config, device)?;
    if reader.remaining() != 0 {
        return Err(Error::CorruptedWeights(format!(
            "{} trailing bytes after the last tensor",
            reader.remaining()
        )));
    }

    let vb = VarBuilder::from_tensors(tensors, dtype, device);
    let model = Transformer::new(&config, vb)?;
    Ok(LoadedModel {
        config,
        processor,
        model,
    })
}

/// Memory-maps and loads a weight file.
#[allow(unsafe_code)]
pub fn load_model(path: impl AsRef<Path>, dtype: DType, device: &Device) -> Result<LoadedModel> {
    let path = path.as_ref();
    let file = File::open(path)?;
    // SAFETY: the mapping is only read, and only while this function runs.
    let mmap = unsafe { Mmap::map(&file)? };
    let loaded = load_from_bytes(&mmap, dtype, device)?;
    info!(
        path = %path.display(),
        bytes = mmap.len(),
        layers = loaded.config.num_hidden_layers,
        vocab = loaded.config.vocab_size,
        "model loaded"
    );
    Ok(loaded)
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

/// Serializes a model into the weight file format (tensors as f32).
///
/// Tensors are written in manifest order; every manifest entry must be present.
pub fn encode_model(
    config: &ModelConfig,
    processor: &Processor,
    tensors: &HashMap<String, Tensor>,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    put_u32(&mut out, VERSION);
    let json = serde_json::to_vec(config)?;
    put_u32(&mut out, json.len() as u32);
    out.extend_from_slice(&json);

    let vocab = processor.vocab();
    put_u32(&mut out, processor.strategy().tag());
    put_u32(&mut out, vocab.len() as u32);
    for token in vocab.tokens() {
        put_str(&mut out, &token.piece);
        out.extend_from_slice(&token.score.to_le_bytes());
        out.push(token.kind as u8);
    }
    let merges = vocab.merges();
    put_u32(&mut out, merges.len() as u32);
    for (left, right) in merges {
        put_str(&mut out, &format!("{left} {right}"));
    }

    for (name, shape) in weight_manifest(config) {
        let tensor = tensors
            .get(&name)
            .ok_or_else(|| Error::Config(format!("missing tensor {name}")))?;
        if tensor.dims() != shape.as_slice() {
            return Err(Error::Config(format!(
                "tensor {name} has shape {:?}, expected {shape:?}",
                tensor.dims()
            )));
        }
        put_str(&mut out, &name);
        put_u32(&mut out, shape.len() as u32);
        for dim in &shape {
            put_u32(&mut out, *dim as u32);
        }
        put_u32(&mut out, DTYPE_F32);
        let values: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    Ok(out)
}

/// Writes a weight file to `path`.
pub fn save_model(
    path: impl AsRef<Path>,
    config: &ModelConfig,
    processor: &Processor,
    tensors: &HashMap<String, Tensor>,
) -> Result<()> {
    let bytes = encode_model(config, processor, tensors)?;
    let mut file = File::create(path.as_ref())?;
    file.write_all(&bytes)?;
    info!(path = %path.as_ref().display(), bytes = bytes.len(), "model written");
    Ok(())
}
