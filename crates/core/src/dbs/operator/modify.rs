use crate::cnf::DEFAULT_BATCH_SIZE;
use crate::ctx::Context;
use crate::dbs::operator::{InputRow, OperatorBase};
use crate::dbs::{Block, RegisterId};
use crate::err::Error;
use crate::kvs::{Collection, Document, DocumentHandle, FROM_ATTRIBUTE, KEY_ATTRIBUTE, TO_ATTRIBUTE};
use crate::plan::ModifyOptions;
use crate::val::{Json, Value};
use std::sync::Arc;

static NONE: Value = Value::None;

/// The four write verbs share one operator frame; they differ in how a
/// row is turned into a storage call and which image they can return.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ModifyVerb {
	Remove,
	Insert,
	Update,
	Replace,
}

/// A data-modification operator: computes one write per input row,
/// submits it through the transaction, and applies the error-tolerance
/// policy. With an out-variable, the pre- or post-image is materialized
/// into the output register.
pub(crate) struct ModifyOperator {
	pub(crate) base: OperatorBase,
	verb: ModifyVerb,
	collection: Arc<Collection>,
	in_reg: RegisterId,
	/// The separate key register of Update/Replace, when the plan
	/// supplies a key variable
	key_reg: Option<RegisterId>,
	options: ModifyOptions,
	out_reg: Option<RegisterId>,
	/// Whether the complete input has been buffered already
	accumulated: bool,
}

impl ModifyOperator {
	pub(crate) fn new(
		base: OperatorBase,
		verb: ModifyVerb,
		collection: Arc<Collection>,
		in_reg: RegisterId,
		key_reg: Option<RegisterId>,
		options: ModifyOptions,
		out_reg: Option<RegisterId>,
	) -> Self {
		Self {
			base,
			verb,
			collection,
			in_reg,
			key_reg,
			options,
			out_reg,
			accumulated: false,
		}
	}

	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		self.base.initialize_cursor(ctx, input).await?;
		self.accumulated = false;
		Ok(())
	}

	pub(crate) async fn get_or_skip_some(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		// A query which reads and writes the same collection must see the
		// complete input before the first write happens
		if self.options.read_complete_input && !self.accumulated {
			while self.base.get_block(ctx, *DEFAULT_BATCH_SIZE, *DEFAULT_BATCH_SIZE).await? {
				ctx.check()?;
			}
			self.accumulated = true;
		}
		let (block, count) = self.base.produce(ctx, at_least, at_most, false).await?;
		let Some(mut block) = block else {
			return Ok((None, 0));
		};
		for row in 0..block.rows() {
			ctx.check()?;
			match self.modify_row(ctx, &block, row) {
				Ok(image) => {
					self.base.stats.incr_writes_executed(1);
					if let Some(out_reg) = self.out_reg {
						block.set(row, out_reg, Value::Json(image));
					}
				}
				Err(Error::DocumentNotFound {
					..
				}) if self.verb == ModifyVerb::Replace
					&& ctx.is_cluster()
					&& self.options.ignore_document_not_found =>
				{
					// On a sharded collection the document may live on
					// another shard; this shard stays silent about it
					self.base.stats.incr_writes_ignored(1);
				}
				Err(Error::DocumentNotFound {
					..
				}) if self.verb == ModifyVerb::Replace && ctx.is_cluster() => {
					return Err(Error::ShardingAttributesChanged);
				}
				Err(e) if e.is_data_error() && self.options.ignore_errors => {
					self.base.stats.incr_writes_ignored(1);
				}
				Err(e) => return Err(e),
			}
		}
		if skipping {
			return Ok((None, count));
		}
		Ok((Some(block), count))
	}

	/// Perform the write for one input row, returning the image selected
	/// by the plan (pre-image or post-image).
	fn modify_row(&self, ctx: &Context, block: &Block, row: usize) -> Result<Json, Error> {
		let store = ctx.store();
		let value = block.get(row, self.in_reg).unwrap_or(&NONE);
		match self.verb {
			ModifyVerb::Remove => {
				let key = extract_key(value)?;
				let old = store.remove(&self.collection, &key, self.options.wait_for_sync)?;
				Ok(old.to_json())
			}
			ModifyVerb::Insert => {
				let doc = document_body(value)?;
				if self.collection.is_edge() {
					check_edge_attributes(&doc)?;
				}
				let new = store.insert(&self.collection, doc, self.options.wait_for_sync)?;
				Ok(new.to_json())
			}
			ModifyVerb::Update => {
				let key = self.row_key(block, row, value)?;
				let patch = document_body(value)?;
				let (old, new) = store.update(
					&self.collection,
					&key,
					&patch,
					self.options.keep_null,
					self.options.merge_objects,
					self.options.wait_for_sync,
				)?;
				Ok(self.image(old, new))
			}
			ModifyVerb::Replace => {
				let key = self.row_key(block, row, value)?;
				let doc = document_body(value)?;
				let (old, new) =
					store.replace(&self.collection, &key, doc, self.options.wait_for_sync)?;
				Ok(self.image(old, new))
			}
		}
	}

	/// The document key for Update/Replace, preferring the separate key
	/// register when the plan supplies one.
	fn row_key(&self, block: &Block, row: usize, value: &Value) -> Result<String, Error> {
		match self.key_reg {
			Some(reg) => extract_key(block.get(row, reg).unwrap_or(&NONE)),
			None => extract_key(value),
		}
	}

	fn image(&self, old: Document, new: Document) -> Json {
		if self.options.return_new_values {
			new.to_json()
		} else {
			old.to_json()
		}
	}
}

/// Extract a document key: preferred from the key attribute of an object
/// value, accepted as a bare string, refused otherwise.
fn extract_key(value: &Value) -> Result<String, Error> {
	let json = match value {
		Value::Json(v) => v,
		Value::Shaped(d) => d.as_json(),
		_ => return Err(Error::DocumentTypeInvalid),
	};
	match json {
		Json::Object(obj) => match obj.get(KEY_ATTRIBUTE) {
			Some(Json::String(key)) => Ok(key.clone()),
			_ => Err(Error::DocumentKeyMissing),
		},
		Json::String(key) => Ok(key.clone()),
		_ => Err(Error::DocumentTypeInvalid),
	}
}

/// The object body of a document-producing row value.
fn document_body(value: &Value) -> Result<Json, Error> {
	let json = match value {
		Value::Json(v) => v.clone(),
		Value::Shaped(d) => d.to_json(),
		_ => return Err(Error::DocumentTypeInvalid),
	};
	if !json.is_object() {
		return Err(Error::DocumentTypeInvalid);
	}
	Ok(json)
}

/// An edge record requires resolvable vertex handles on both ends.
fn check_edge_attributes(doc: &Json) -> Result<(), Error> {
	for attribute in [FROM_ATTRIBUTE, TO_ATTRIBUTE] {
		match doc.get(attribute) {
			Some(value) => {
				DocumentHandle::from_json(value)?;
			}
			None => {
				return Err(Error::DocumentHandleBad {
					handle: format!("missing {attribute}"),
				});
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn key_extraction_rules() {
		let key = extract_key(&Value::Json(json!({"_key": "a", "x": 1}))).unwrap();
		assert_eq!(key, "a");
		let key = extract_key(&Value::Json(json!("b"))).unwrap();
		assert_eq!(key, "b");
		assert!(matches!(
			extract_key(&Value::Json(json!({"x": 1}))),
			Err(Error::DocumentKeyMissing)
		));
		assert!(matches!(
			extract_key(&Value::Json(json!(42))),
			Err(Error::DocumentTypeInvalid)
		));
		assert!(matches!(extract_key(&Value::None), Err(Error::DocumentTypeInvalid)));
	}

	#[test]
	fn edge_attributes_are_validated() {
		assert!(check_edge_attributes(&json!({"_from": "v/a", "_to": "v/b"})).is_ok());
		assert!(matches!(
			check_edge_attributes(&json!({"_from": "v/a"})),
			Err(Error::DocumentHandleBad { .. })
		));
		assert!(matches!(
			check_edge_attributes(&json!({"_from": "nope", "_to": "v/b"})),
			Err(Error::DocumentHandleBad { .. })
		));
	}
}
