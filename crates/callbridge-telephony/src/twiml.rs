//! TwiML documents served to the provider when a call connects.

/// Escapes text for use inside an XML attribute value.
fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Builds a document that connects the call audio to a bidirectional media
/// stream at `stream_url`.
///
/// Each `(name, value)` pair becomes a `<Parameter>` and shows up in the
/// stream's `start` event under `customParameters`.
pub fn connect_stream_twiml(stream_url: &str, parameters: &[(&str, &str)]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Connect>");
    xml.push_str(&format!("<Stream url=\"{}\"", escape_attr(stream_url)));
    if parameters.is_empty() {
        xml.push_str(" />");
    } else {
        xml.push('>');
        for (name, value) in parameters {
            xml.push_str(&format!(
                "<Parameter name=\"{}\" value=\"{}\" />",
                escape_attr(name),
                escape_attr(value)
            ));
        }
        xml.push_str("</Stream>");
    }
    xml.push_str("</Connect></Response>");
    xml
}
