use crate::types::{CallFlags, MethodToken};
use crate::utils::{hash256, write_var_bytes, write_var_int, write_var_string, ByteReader};
use ethereum_types::H160;
use thiserror::Error;

/// `NEF3` read as a little-endian u32.
pub const NEF_MAGIC: u32 = 0x3346_454E;
pub const COMPILER_FIELD_SIZE: usize = 64;
pub const MAX_SOURCE_URL: usize = 256;
pub const MAX_SCRIPT_SIZE: usize = 1024 * 1024;
/// Tokens are addressed by a 16-bit `CALLT` operand.
pub const MAX_TOKENS: usize = 65_536;
pub const MAX_TOKEN_METHOD: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NefError {
    #[error("bad magic 0x{0:08x}")]
    InvalidMagic(u32),
    #[error("compiler name is {0} bytes, the field holds {COMPILER_FIELD_SIZE}")]
    CompilerTooLong(usize),
    #[error("source URL is {0} bytes, at most {MAX_SOURCE_URL} allowed")]
    SourceTooLong(usize),
    #[error("script is empty")]
    EmptyScript,
    #[error("script is {0} bytes, at most {MAX_SCRIPT_SIZE} allowed")]
    ScriptTooLarge(usize),
    #[error("{0} method tokens, at most {MAX_TOKENS} addressable")]
    TooManyTokens(usize),
    #[error("token method '{0}' is longer than {MAX_TOKEN_METHOD} bytes")]
    TokenMethodTooLong(String),
    #[error("token method '{0}' is not callable")]
    ReservedTokenMethod(String),
    #[error("reserved {0} is not zero")]
    ReservedNotZero(&'static str),
    #[error("checksum mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("{0} trailing bytes after checksum")]
    TrailingBytes(usize),
    #[error("malformed container: {0}")]
    Malformed(String),
}

/// Final executable artifact: script, method tokens and integrity checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledScript {
    pub compiler: String,
    pub source: String,
    pub script: Vec<u8>,
    pub tokens: Vec<MethodToken>,
    pub checksum: u32,
}

impl CompiledScript {
    pub fn new(compiler: &str, source: &str, script: Vec<u8>, tokens: Vec<MethodToken>) -> Result<Self, NefError> {
        if compiler.len() > COMPILER_FIELD_SIZE {
            return Err(NefError::CompilerTooLong(compiler.len()));
        }
        if source.len() > MAX_SOURCE_URL {
            return Err(NefError::SourceTooLong(source.len()));
        }
        if script.is_empty() {
            return Err(NefError::EmptyScript);
        }
        if script.len() > MAX_SCRIPT_SIZE {
            return Err(NefError::ScriptTooLarge(script.len()));
        }
        if tokens.len() > MAX_TOKENS {
            return Err(NefError::TooManyTokens(tokens.len()));
        }
        for token in &tokens {
            check_token_method(&token.method)?;
        }
        let mut nef = CompiledScript {
            compiler: compiler.to_string(),
            source: source.to_string(),
            script,
            tokens,
            checksum: 0,
        };
        nef.checksum = compute_checksum(&nef.unsigned_bytes());
        Ok(nef)
    }

    /// Everything the checksum covers.
    fn unsigned_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.script.len() + COMPILER_FIELD_SIZE + 32);
        out.extend_from_slice(&NEF_MAGIC.to_le_bytes());
        let mut compiler = [0u8; COMPILER_FIELD_SIZE];
        compiler[..self.compiler.len()].copy_from_slice(self.compiler.as_bytes());
        out.extend_from_slice(&compiler);
        write_var_string(&mut out, &self.source);
        out.push(0);
        write_var_bytes(&mut out, &self.script);
        write_var_int(&mut out, self.tokens.len() as u64);
        for token in &self.tokens {
            out.extend_from_slice(token.hash.as_bytes());
            write_var_string(&mut out, &token.method);
            out.push(token.parameters_count);
            out.push(token.call_flags.bits());
        }
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.unsigned_bytes();
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out
    }

    /// Parses and verifies a container.
    pub fn from_bytes(data: &[u8]) -> Result<Self, NefError> {
        let (nef, signed_len) = Self::read(data)?;
        let computed = compute_checksum(&data[..signed_len]);
        if nef.checksum != computed {
            return Err(NefError::ChecksumMismatch { stored: nef.checksum, computed });
        }
        Ok(nef)
    }

    /// Parses a container without checking its checksum.
    pub fn from_bytes_unverified(data: &[u8]) -> Result<Self, NefError> {
        Self::read(data).map(|(nef, _)| nef)
    }

    /// Checksum the container should carry.
    pub fn expected_checksum(&self) -> u32 {
        compute_checksum(&self.unsigned_bytes())
    }

    fn read(data: &[u8]) -> Result<(Self, usize), NefError> {
        let mut reader = ByteReader::new(data);
        let magic = reader.read_u32().map_err(NefError::Malformed)?;
        if magic != NEF_MAGIC {
            return Err(NefError::InvalidMagic(magic));
        }
        let compiler_field = reader.read_bytes(COMPILER_FIELD_SIZE).map_err(NefError::Malformed)?;
        let compiler_len = compiler_field.iter().position(|b| *b == 0).unwrap_or(COMPILER_FIELD_SIZE);
        let compiler = std::str::from_utf8(&compiler_field[..compiler_len])
            .map_err(|e| NefError::Malformed(format!("compiler field: {}", e)))?
            .to_string();
        let source = reader.read_var_string(MAX_SOURCE_URL).map_err(NefError::Malformed)?;
        if reader.read_u8().map_err(NefError::Malformed)? != 0 {
            return Err(NefError::ReservedNotZero("byte"));
        }
        let script = reader.read_var_bytes(MAX_SCRIPT_SIZE).map_err(NefError::Malformed)?.to_vec();
        if script.is_empty() {
            return Err(NefError::EmptyScript);
        }

        let count = reader.read_var_int(MAX_TOKENS as u64).map_err(NefError::Malformed)? as usize;
        let mut tokens = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let hash = H160::from_slice(reader.read_bytes(20).map_err(NefError::Malformed)?);
            let method = reader.read_var_string(MAX_TOKEN_METHOD).map_err(NefError::Malformed)?;
            check_token_method(&method)?;
            let parameters_count = reader.read_u8().map_err(NefError::Malformed)?;
            let flags = reader.read_u8().map_err(NefError::Malformed)?;
            let call_flags = CallFlags::try_from(crate::types::CallFlagsRepr::Bits(flags)).map_err(NefError::Malformed)?;
            tokens.push(MethodToken { hash, method, parameters_count, call_flags });
        }

        if reader.read_u16().map_err(NefError::Malformed)? != 0 {
            return Err(NefError::ReservedNotZero("u16"));
        }
        let signed_len = reader.position();
        let stored = reader.read_u32().map_err(NefError::Malformed)?;
        if reader.remaining() != 0 {
            return Err(NefError::TrailingBytes(reader.remaining()));
        }
        Ok((CompiledScript { compiler, source, script, tokens, checksum: stored }, signed_len))
    }

    pub fn size(&self) -> usize {
        self.unsigned_bytes().len() + 4
    }
}

/// Methods starting with `_` are reserved for the runtime and cannot be called through a token.
pub fn check_token_method(method: &str) -> Result<(), NefError> {
    if method.len() > MAX_TOKEN_METHOD {
        return Err(NefError::TokenMethodTooLong(method.to_string()));
    }
    if method.starts_with('_') {
        return Err(NefError::ReservedTokenMethod(method.to_string()));
    }
    Ok(())
}

/// First four bytes of double SHA-256, little-endian.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let digest = hash256(data);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_script_hash;

    fn sample() -> CompiledScript {
        let token = MethodToken {
            hash: parse_script_hash("0xd2a4cff31913016155e38e474a2c06d08be276cf").unwrap(),
            method: "transfer".into(),
            parameters_count: 4,
            call_flags: CallFlags::ALL,
        };
        CompiledScript::new("nccs-rs 0.1.0", "https://example.org/token", vec![0x37, 0x00, 0x00, 0x40], vec![token])
            .unwrap()
    }

    #[test]
    fn test_layout() {
        let bytes = sample().to_bytes();
        assert_eq!(&bytes[..4], b"NEF3");
        assert_eq!(&bytes[4..17], b"nccs-rs 0.1.0");
        assert!(bytes[17..68].iter().all(|b| *b == 0));
        assert_eq!(bytes[68] as usize, "https://example.org/token".len());
        let reserved = 69 + 25;
        assert_eq!(bytes[reserved], 0);
        assert_eq!(&bytes[reserved + 1..reserved + 6], &[4, 0x37, 0x00, 0x00, 0x40]);
        assert_eq!(bytes[reserved + 6], 1, "one token");
        assert_eq!(&bytes[reserved + 7..reserved + 27], sample().tokens[0].hash.as_bytes());
        assert_eq!(&bytes[bytes.len() - 6..bytes.len() - 4], &[0, 0], "reserved u16");
        assert_eq!(compute_checksum(&bytes[..bytes.len() - 4]).to_le_bytes(), bytes[bytes.len() - 4..]);
    }

    #[test]
    fn test_parse_back() {
        let nef = sample();
        let parsed = CompiledScript::from_bytes(&nef.to_bytes()).unwrap();
        assert_eq!(parsed, nef);
        assert_eq!(parsed.size(), nef.to_bytes().len());
    }

    #[test]
    fn test_rejects_corruption() {
        let mut bytes = sample().to_bytes();
        bytes[69 + 25 + 5] ^= 0xff;
        assert!(matches!(CompiledScript::from_bytes(&bytes), Err(NefError::ChecksumMismatch { .. })));
        let unverified = CompiledScript::from_bytes_unverified(&bytes).unwrap();
        assert_eq!(unverified.checksum, sample().checksum);
        assert_ne!(unverified.expected_checksum(), unverified.checksum);

        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(CompiledScript::from_bytes(&bytes), Err(NefError::InvalidMagic(_))));

        let mut bytes = sample().to_bytes();
        bytes.push(0);
        assert_eq!(CompiledScript::from_bytes(&bytes), Err(NefError::TrailingBytes(1)));

        let bytes = sample().to_bytes();
        assert!(matches!(CompiledScript::from_bytes(&bytes[..40]), Err(NefError::Malformed(_))));
    }

    #[test]
    fn test_field_limits() {
        assert_eq!(
            CompiledScript::new(&"c".repeat(65), "", vec![0x40], vec![]),
            Err(NefError::CompilerTooLong(65))
        );
        assert_eq!(
            CompiledScript::new("c", &"s".repeat(257), vec![0x40], vec![]),
            Err(NefError::SourceTooLong(257))
        );
        assert_eq!(CompiledScript::new("c", "", vec![], vec![]), Err(NefError::EmptyScript));
        assert_eq!(
            CompiledScript::new("c", "", vec![0x21; MAX_SCRIPT_SIZE + 1], vec![]),
            Err(NefError::ScriptTooLarge(MAX_SCRIPT_SIZE + 1))
        );
    }

    #[test]
    fn test_writer_and_reader_agree_on_tokens() {
        let mut token = sample().tokens[0].clone();
        token.method = "_deploy".into();
        assert_eq!(
            CompiledScript::new("c", "", vec![0x40], vec![token.clone()]),
            Err(NefError::ReservedTokenMethod("_deploy".into()))
        );
        token.method = "m".repeat(MAX_TOKEN_METHOD + 1);
        assert!(matches!(
            CompiledScript::new("c", "", vec![0x40], vec![token]),
            Err(NefError::TokenMethodTooLong(_))
        ));

        // The largest container the writer accepts parses back unchanged.
        let mut script = vec![0x21; MAX_SCRIPT_SIZE - 1];
        script.push(0x40);
        let mut token = sample().tokens[0].clone();
        token.method = "m".repeat(MAX_TOKEN_METHOD);
        let nef = CompiledScript::new(&"c".repeat(COMPILER_FIELD_SIZE), &"s".repeat(MAX_SOURCE_URL), script, vec![token])
            .unwrap();
        assert_eq!(CompiledScript::from_bytes(&nef.to_bytes()).unwrap(), nef);
    }
}
