//! Discovery of remote reference URLs anywhere in a schema document.

use serde_json::Value;

/// Every absolute http(s) `$ref` in the document, in discovery order,
/// de-duplicated. Local pointers (`#/...`) are not references to other
/// documents and are ignored.
pub fn collect_ref_urls(doc: &Value) -> Vec<String> {
    let mut out = Vec::new();
    walk(doc, &mut out);
    out
}

fn walk(v: &Value, out: &mut Vec<String>) {
    match v {
        Value::Object(map) => {
            if let Some(Value::String(r)) = map.get("$ref") {
                if (r.starts_with("http://") || r.starts_with("https://"))
                    && !out.contains(r)
                {
                    out.push(r.clone());
                }
            }
            for child in map.values() {
                walk(child, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                walk(child, out);
            }
        }
        _ => {}
    }
}
