//! Composition-domain handlers over the prompt composer.

use std::sync::Arc;

use serde_json::{json, Value};

use ksi_protocol::commands::{
    ComposePromptParams, GetCompositionParams, GetCompositionsParams, ListComponentsParams,
    ValidateCompositionParams,
};
use ksi_protocol::error::CommandError;
use ksi_protocol::ErrorCode;

use super::parse_params;
use crate::composer::ComposerError;
use crate::daemon::DaemonCore;

fn composer_error(e: ComposerError) -> CommandError {
    let code = match &e {
        ComposerError::CompositionNotFound { .. } => ErrorCode::CompositionNotFound,
        ComposerError::ComponentNotFound { .. } => ErrorCode::ComponentNotFound,
        ComposerError::CircularDependency { .. } => ErrorCode::CompositionInvalid,
        ComposerError::MissingContext { .. } => ErrorCode::ContextValidationError,
        ComposerError::Invalid { .. } => ErrorCode::CompositionInvalid,
        ComposerError::Template(_) => ErrorCode::CompositionFailed,
        ComposerError::Io(_) => ErrorCode::ComposerUnavailable,
    };
    CommandError::new(code, e.to_string())
}

pub fn get_compositions(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: GetCompositionsParams = parse_params(params)?;
    let compositions = core.composer.composition_summaries(params.include_metadata);
    Ok(json!({"count": compositions.len(), "compositions": compositions}))
}

pub fn get_composition(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: GetCompositionParams = parse_params(params)?;
    let doc = core.composer.load_raw(&params.name).map_err(composer_error)?;
    let mut result = serde_json::to_value(&doc)
        .map_err(|e| CommandError::new(ErrorCode::CommandProcessingFailed, e.to_string()))?;
    if !params.include_metadata {
        if let Some(obj) = result.as_object_mut() {
            obj.remove("metadata");
        }
    }
    Ok(json!({"composition": result}))
}

pub fn validate_composition(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: ValidateCompositionParams = parse_params(params)?;
    let context = params.context.unwrap_or_else(|| json!({}));
    // Validation problems are data, not errors: the reply is success with
    // `valid=false` and the issue list.
    let (valid, issues) = core.composer.validate(&params.name, &context);
    Ok(json!({
        "name": params.name,
        "valid": valid,
        "issues": issues,
    }))
}

pub fn compose_prompt(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: ComposePromptParams = parse_params(params)?;
    let context = params.context.unwrap_or_else(|| json!({}));
    let prompt = core
        .composer
        .compose(&params.composition, &context)
        .map_err(composer_error)?;
    Ok(json!({
        "composition": params.composition,
        "prompt": prompt,
        "warnings": [],
    }))
}

pub fn list_components(core: &Arc<DaemonCore>, params: Value) -> Result<Value, CommandError> {
    let params: ListComponentsParams = parse_params(params)?;
    let components = core
        .composer
        .list_components(params.directory.as_deref())
        .map_err(composer_error)?;
    Ok(json!({"count": components.len(), "components": components}))
}
