//! Command templates.
//!
//! A tool declares its invocation as a single line of text with named
//! placeholders in braces, e.g. `spades.py -1 {read1} -2 {read2} -o {output_dir}`.
//! The template is tokenized once into literal segments and placeholders so
//! that expansion is a fold over typed tokens rather than repeated string
//! replacement (`{input_file_1}` can never clobber `{input_file_10}`).
//!
//! Braces whose contents are not in the placeholder vocabulary are kept as
//! literal text, so shell constructs like `${HOME}` or `awk '{print $1}'`
//! pass through untouched.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed placeholder vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    /// `{input_files}`: every resolved input, space-joined
    InputFiles,

    /// `{input_file_N}`: the Nth resolved input (1-based)
    InputFile(usize),

    /// `{output_dir}`
    OutputDir,

    /// `{read1}`: alias for `{input_file_1}`
    Read1,

    /// `{read2}`: alias for `{input_file_2}`
    Read2,

    /// `{reference}`: alias for `{input_file_1}`
    Reference,

    /// `{assembly_files}`: alias for `{input_files}`
    AssemblyFiles,

    /// `{threads}`
    Threads,

    /// `{memory}`
    Memory,
}

impl Placeholder {
    /// Parse the text between braces. Returns `None` for anything outside the vocabulary.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "input_files" => Some(Self::InputFiles),
            "output_dir" => Some(Self::OutputDir),
            "read1" => Some(Self::Read1),
            "read2" => Some(Self::Read2),
            "reference" => Some(Self::Reference),
            "assembly_files" => Some(Self::AssemblyFiles),
            "threads" => Some(Self::Threads),
            "memory" => Some(Self::Memory),
            other => {
                let index = other.strip_prefix("input_file_")?;
                if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                match index.parse::<usize>() {
                    Ok(n) if n >= 1 => Some(Self::InputFile(n)),
                    _ => None,
                }
            }
        }
    }

    /// Whether expanding this placeholder reads from the resolved input list
    pub fn reads_inputs(&self) -> bool {
        matches!(
            self,
            Self::InputFiles
                | Self::InputFile(_)
                | Self::Read1
                | Self::Read2
                | Self::Reference
                | Self::AssemblyFiles
        )
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputFiles => write!(f, "{{input_files}}"),
            Self::InputFile(n) => write!(f, "{{input_file_{}}}", n),
            Self::OutputDir => write!(f, "{{output_dir}}"),
            Self::Read1 => write!(f, "{{read1}}"),
            Self::Read2 => write!(f, "{{read2}}"),
            Self::Reference => write!(f, "{{reference}}"),
            Self::AssemblyFiles => write!(f, "{{assembly_files}}"),
            Self::Threads => write!(f, "{{threads}}"),
            Self::Memory => write!(f, "{{memory}}"),
        }
    }
}

/// One token of a parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

/// A parsed command template.
///
/// Serializes as its source text; deserializing re-tokenizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CommandTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    /// Tokenize a template. Never fails: unknown `{...}` groups and unbalanced
    /// braces are literal text.
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after_open = &rest[open + 1..];

            match after_open.find('}') {
                Some(close) => {
                    let name = &after_open[..close];
                    match Placeholder::parse(name) {
                        Some(placeholder) => {
                            if !literal.is_empty() {
                                segments.push(Segment::Literal(std::mem::take(&mut literal)));
                            }
                            segments.push(Segment::Placeholder(placeholder));
                            rest = &after_open[close + 1..];
                        }
                        None => {
                            // Keep the brace and rescan from the next char so a nested
                            // `{{output_dir}}` still yields a placeholder.
                            literal.push('{');
                            rest = after_open;
                        }
                    }
                }
                None => {
                    literal.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self {
            source: source.to_string(),
            segments,
        }
    }

    /// The template text as declared
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.source.trim().is_empty()
    }

    /// Iterate the placeholders in order of appearance
    pub fn placeholders(&self) -> impl Iterator<Item = Placeholder> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(p) => Some(*p),
            Segment::Literal(_) => None,
        })
    }

    /// Whether the template consumes any resolved input file
    pub fn requires_inputs(&self) -> bool {
        self.placeholders().any(|p| p.reads_inputs())
    }

    /// Expand the template by folding each token through `resolve`
    pub fn render<F>(&self, mut resolve: F) -> String
    where
        F: FnMut(Placeholder) -> String,
    {
        self.segments
            .iter()
            .fold(String::with_capacity(self.source.len()), |mut out, segment| {
                match segment {
                    Segment::Literal(text) => out.push_str(text),
                    Segment::Placeholder(p) => out.push_str(&resolve(*p)),
                }
                out
            })
    }
}

impl From<String> for CommandTemplate {
    fn from(source: String) -> Self {
        Self::parse(&source)
    }
}

impl From<CommandTemplate> for String {
    fn from(template: CommandTemplate) -> Self {
        template.source
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
