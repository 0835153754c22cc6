use crate::err::Error;
use std::fmt;

/// The reason why a context stopped being usable
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reason {
	/// The query deadline was reached
	Timedout,
	/// The query was killed by an outside actor
	Killed,
}

impl fmt::Display for Reason {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Reason::Timedout => write!(f, "Query timed out"),
			Reason::Killed => write!(f, "Query killed"),
		}
	}
}

impl From<Reason> for Error {
	fn from(_: Reason) -> Self {
		Error::QueryKilled
	}
}
