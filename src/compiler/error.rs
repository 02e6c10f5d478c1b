use crate::compiler::ast::SourceLocation;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// A source construct with no defined lowering.
    #[error("{location}unsupported construct: {construct}")]
    Unsupported { construct: String, location: Located },

    /// A call, jump or event target that cannot be found.
    #[error("{location}unresolved reference: {name}")]
    UnresolvedReference { name: String, location: Located },

    /// A manifest-visible type with no ABI primitive kind.
    #[error("{location}type '{type_name}' of {member} has no ABI mapping")]
    TypeMapping { member: String, type_name: String, location: Located },

    /// An operand or table index that does not fit its fixed-width encoding.
    #[error("{location}encoding overflow: {what}")]
    EncodingOverflow { what: String, location: Located },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A broken compiler invariant. Never caused by valid input.
    #[error("internal compiler error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn unsupported(construct: impl Into<String>) -> Self {
        CompileError::Unsupported { construct: construct.into(), location: Located::default() }
    }

    pub fn unresolved(name: impl Into<String>) -> Self {
        CompileError::UnresolvedReference { name: name.into(), location: Located::default() }
    }

    pub fn overflow(what: impl Into<String>) -> Self {
        CompileError::EncodingOverflow { what: what.into(), location: Located::default() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::Internal(message.into())
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, CompileError::Internal(_))
    }

    #[cfg(test)]
    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            CompileError::Unsupported { location, .. }
            | CompileError::UnresolvedReference { location, .. }
            | CompileError::TypeMapping { location, .. }
            | CompileError::EncodingOverflow { location, .. } => location.0.as_ref(),
            CompileError::InvalidManifest(_) | CompileError::Internal(_) => None,
        }
    }

    /// Attaches a location unless the error already carries one.
    pub fn at(mut self, at: Option<&SourceLocation>) -> Self {
        let Some(at) = at else {
            return self;
        };
        match &mut self {
            CompileError::Unsupported { location, .. }
            | CompileError::UnresolvedReference { location, .. }
            | CompileError::TypeMapping { location, .. }
            | CompileError::EncodingOverflow { location, .. } => {
                if location.0.is_none() {
                    location.0 = Some(at.clone());
                }
            }
            CompileError::InvalidManifest(_) | CompileError::Internal(_) => {}
        }
        self
    }
}

/// Optional source location rendered as a `file:line:col: ` prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Located(pub Option<SourceLocation>);

impl fmt::Display for Located {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(location) => write!(f, "{}: ", location),
            None => Ok(()),
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;

/// Every fatal diagnostic gathered for one compilation unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{}", render_batch(.0))]
pub struct CompileErrors(pub Vec<CompileError>);

impl CompileErrors {
    pub fn push(&mut self, error: CompileError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompileError> {
        self.0.iter()
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), CompileErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<CompileError> for CompileErrors {
    fn from(error: CompileError) -> Self {
        CompileErrors(vec![error])
    }
}

/// A lone error prints as itself, a batch as a counted list.
fn render_batch(errors: &[CompileError]) -> String {
    match errors {
        [single] => single.to_string(),
        errors => {
            let mut out = format!("{} errors:\n", errors.len());
            for error in errors {
                out.push_str(&format!("  {}\n", error));
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> SourceLocation {
        SourceLocation { document: "Contract.cs".into(), start_line: 3, start_column: 9, end_line: 3, end_column: 20 }
    }

    #[test]
    fn test_location_prefix() {
        let error = CompileError::unsupported("lock statement").at(Some(&location()));
        assert_eq!(error.to_string(), "Contract.cs:3:9: unsupported construct: lock statement");
    }

    #[test]
    fn test_first_location_wins() {
        let inner = SourceLocation { start_line: 7, ..location() };
        let error = CompileError::unresolved("Foo").at(Some(&inner)).at(Some(&location()));
        assert_eq!(error.location().map(|l| l.start_line), Some(7));
    }

    #[test]
    fn test_internal_has_no_location() {
        let error = CompileError::internal("label 3 undefined").at(Some(&location()));
        assert!(error.is_internal());
        assert!(error.location().is_none());
    }

    #[test]
    fn test_batch_display() {
        let mut errors = CompileErrors::default();
        assert!(errors.clone().into_result().is_ok());
        errors.push(CompileError::unresolved("a"));
        errors.push(CompileError::overflow("too many locals"));
        let rendered = errors.to_string();
        assert!(rendered.starts_with("2 errors:"));
        assert!(rendered.contains("encoding overflow: too many locals"));
        assert_eq!(rendered.lines().count(), 3);

        let single = CompileErrors::from(CompileError::unresolved("label 'x'"));
        assert_eq!(single.to_string(), "unresolved reference: label 'x'");
        let boxed: Box<dyn std::error::Error> = Box::new(single);
        assert!(boxed.source().is_none());
    }
}
