//! Client options

// Imports
use {
	crate::error::ConfigError,
	std::{path::PathBuf, str::FromStr},
};

/// Client options
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Options {
	/// Name of the pipe to send the trace to
	pub ipc_name: String,
}

impl Options {
	/// Parses options from an option string.
	///
	/// The only option is the required `-ipc <name>`.
	pub fn parse(opstr: &str) -> Result<Self, ConfigError> {
		let mut ipc_name = None;

		let mut tokens = self::tokenize(opstr)?.into_iter();
		while let Some(token) = tokens.next() {
			match token.as_str() {
				"-ipc" => {
					let name = tokens.next().ok_or(ConfigError::MissingIpcValue)?;
					ipc_name = Some(name);
				},
				_ => {
					tracing::error!(option = ?token, "Unrecognized option");
					return Err(ConfigError::UnrecognizedOption { option: token });
				},
			}
		}

		let ipc_name = ipc_name.ok_or(ConfigError::MissingIpcName)?;
		if ipc_name.is_empty() || ipc_name.contains(|ch: char| matches!(ch, '/' | '\\' | '\0')) {
			return Err(ConfigError::MalformedIpcName { name: ipc_name });
		}

		Ok(Self { ipc_name })
	}

	/// Returns the path of the pipe
	#[cfg(unix)]
	pub fn pipe_path(&self) -> PathBuf {
		crate::channel::NamedPipe::path_for(&self.ipc_name)
	}
}

impl FromStr for Options {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

/// Splits an option string into whitespace-separated tokens.
///
/// Double quotes group a token containing whitespace.
fn tokenize(s: &str) -> Result<Vec<String>, ConfigError> {
	let mut tokens = vec![];
	let mut chars = s.chars().peekable();
	loop {
		// Skip whitespace until the next token
		while chars.next_if(|ch| ch.is_whitespace()).is_some() {}
		if chars.peek().is_none() {
			break;
		}

		let mut token = String::new();
		let mut quoted = false;
		while let Some(ch) = chars.next_if(|&ch| quoted || !ch.is_whitespace()) {
			match ch {
				'"' => quoted = !quoted,
				ch => token.push(ch),
			}
		}
		if quoted {
			return Err(ConfigError::UnterminatedQuote);
		}

		tokens.push(token);
	}

	Ok(tokens)
}
