use crate::err::Error;
use crate::val::{json_is_truthy as is_true, Json};
use serde::{Deserialize, Serialize};

/// The options attached to a modification node by the planner.
///
/// Options must be compile-time constant: a plan whose options reference
/// runtime values marks them [`OptionsSource::Dynamic`], which the engine
/// rejects before any row moves.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OptionsSource {
	/// No options were specified
	#[default]
	None,
	/// A constant options object
	Constant(Json),
	/// The options referenced non-constant values
	Dynamic,
}

/// The recognized, uniform option set of the modification operators.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModifyOptions {
	/// Treat per-document errors as ignored instead of fatal
	pub ignore_errors: bool,
	/// Wait for the write to be durable before reporting success
	pub wait_for_sync: bool,
	/// Keep attributes which an update patch sets to null
	pub keep_null: bool,
	/// Merge object attributes recursively instead of replacing them
	pub merge_objects: bool,
	/// Silently skip documents a sharded replace cannot find locally
	pub ignore_document_not_found: bool,
	/// Buffer the complete input before writing, required when a query
	/// reads and writes the same collection
	pub read_complete_input: bool,
	/// Materialize the post-image instead of the pre-image into the
	/// out-variable
	pub return_new_values: bool,
}

impl Default for ModifyOptions {
	fn default() -> Self {
		Self {
			ignore_errors: false,
			wait_for_sync: false,
			keep_null: true,
			merge_objects: true,
			ignore_document_not_found: false,
			read_complete_input: false,
			return_new_values: false,
		}
	}
}

impl ModifyOptions {
	/// Resolve an options source into the recognized option set. Dynamic
	/// options fail here, before execution starts.
	pub fn compile(source: &OptionsSource) -> Result<Self, Error> {
		let value = match source {
			OptionsSource::None => return Ok(Self::default()),
			OptionsSource::Dynamic => return Err(Error::CompileTimeOptions),
			OptionsSource::Constant(value) => value,
		};
		let Some(obj) = value.as_object() else {
			return Err(Error::CompileTimeOptions);
		};
		let mut options = Self::default();
		// `mergeArrays` is the deprecated spelling of `mergeObjects`; the
		// current name wins when both are present
		if let Some(v) = obj.get("mergeArrays") {
			options.merge_objects = is_true(v);
		}
		for (key, v) in obj {
			match key.as_str() {
				"ignoreErrors" => options.ignore_errors = is_true(v),
				"waitForSync" => options.wait_for_sync = is_true(v),
				"keepNull" => options.keep_null = is_true(v),
				"mergeObjects" => options.merge_objects = is_true(v),
				"ignoreDocumentNotFound" => options.ignore_document_not_found = is_true(v),
				"readCompleteInput" => options.read_complete_input = is_true(v),
				"returnNewValues" => options.return_new_values = is_true(v),
				_ => (),
			}
		}
		Ok(options)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn defaults_keep_null_and_merge() {
		let options = ModifyOptions::compile(&OptionsSource::None).unwrap();
		assert!(options.keep_null);
		assert!(options.merge_objects);
		assert!(!options.ignore_errors);
	}

	#[test]
	fn dynamic_options_are_rejected() {
		let err = ModifyOptions::compile(&OptionsSource::Dynamic).unwrap_err();
		assert!(matches!(err, Error::CompileTimeOptions));
	}

	#[test]
	fn merge_arrays_is_an_alias() {
		let options = ModifyOptions::compile(&OptionsSource::Constant(json!({
			"mergeArrays": false,
		})))
		.unwrap();
		assert!(!options.merge_objects);
		// The current spelling wins over the deprecated one
		let options = ModifyOptions::compile(&OptionsSource::Constant(json!({
			"mergeArrays": false,
			"mergeObjects": true,
		})))
		.unwrap();
		assert!(options.merge_objects);
	}

	#[test]
	fn unknown_options_are_ignored() {
		let options = ModifyOptions::compile(&OptionsSource::Constant(json!({
			"ignoreErrors": 1,
			"someFutureOption": true,
		})))
		.unwrap();
		assert!(options.ignore_errors);
	}
}
