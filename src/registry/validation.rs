use jsonschema::Validator;
use serde_json::{json, Value};

/// Compile an argument shape. Fails if the shape is not a usable JSON Schema.
pub fn compile(schema: &Value) -> Result<Validator, String> {
    Validator::new(schema).map_err(|e| format!("Invalid schema: {}", e))
}

/// Check a call's arguments against a compiled shape.
pub fn check(validator: &Validator, input: &Value) -> Result<(), String> {
    validator.validate(input).map_err(|e| e.to_string())
}

/// Shape for capabilities that take no arguments.
pub fn no_args() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false
    })
}

/// Shape that accepts any argument object.
pub fn any_object() -> Value {
    json!({ "type": "object" })
}
