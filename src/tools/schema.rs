//! 工具参数 JSON Schema 生成（schemars 自动生成，替代手写 schema）

use schemars::{gen::SchemaSettings, JsonSchema};
use serde_json::Value;

/// 为参数结构体生成 `inputSchema`：内联子类型，去掉 `$schema`/`title` 元信息
pub fn args_schema<T: JsonSchema>() -> Value {
    let settings = SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = true;
        s.meta_schema = None;
    });
    let schema = settings.into_generator().into_root_schema_for::<T>();
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| empty_object_schema());
    if let Value::Object(obj) = &mut value {
        obj.remove("title");
        obj.remove("definitions");
    }
    value
}

/// 无参数工具的 schema
pub fn empty_object_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Args {
        /// 必填
        summary: String,
        tags: Option<Vec<String>>,
    }

    #[test]
    fn test_args_schema_marks_required() {
        let schema = args_schema::<Args>();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["summary"].is_object());
        assert!(schema["properties"]["tags"].is_object());
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(required, vec!["summary"]);
        assert!(schema.get("$schema").is_none());
    }
}
