//! Small helpers around `quick-xml` shared by the sitemap and feed parsers.

use quick_xml::escape::{resolve_predefined_entity, unescape};
use quick_xml::events::{BytesStart, Event};

/// Append the character data carried by `event` to `out`.
///
/// Handles plain text, CDATA sections and entity/character references.
/// Returns `false` for events that carry no character data.
pub fn append_text(event: &Event<'_>, out: &mut String) -> bool {
    match event {
        Event::Text(t) => {
            let raw = String::from_utf8_lossy(t);
            match unescape(&raw) {
                Ok(text) => out.push_str(&text),
                Err(_) => out.push_str(&raw),
            }
            true
        }
        Event::CData(c) => {
            out.push_str(&String::from_utf8_lossy(c));
            true
        }
        Event::GeneralRef(r) => {
            let name = String::from_utf8_lossy(r);
            match resolve_reference(&name) {
                Some(resolved) => out.push_str(&resolved),
                None => {
                    out.push('&');
                    out.push_str(&name);
                    out.push(';');
                }
            }
            true
        }
        _ => false,
    }
}

fn resolve_reference(name: &str) -> Option<String> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }
    resolve_predefined_entity(name).map(str::to_string)
}

/// Local (namespace-free) name of an element as an owned string.
pub fn local_name(name: quick_xml::name::LocalName<'_>) -> String {
    String::from_utf8_lossy(name.as_ref()).to_ascii_lowercase()
}

/// Unescaped value of the attribute whose local name is `name`.
pub fn attribute(element: &BytesStart<'_>, name: &str) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref().eq_ignore_ascii_case(name.as_bytes()))
        .map(|attr| {
            let raw = String::from_utf8_lossy(&attr.value);
            unescape(&raw).map_or_else(|_| raw.to_string(), |value| value.into_owned())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quick_xml::Reader;

    fn text_of(xml: &str) -> String {
        let mut reader = Reader::from_str(xml);
        let mut out = String::new();
        loop {
            match reader.read_event().unwrap() {
                Event::Eof => break,
                ev => {
                    append_text(&ev, &mut out);
                }
            }
        }
        out
    }

    #[test]
    fn test_resolves_entities_and_cdata() {
        assert_eq!(text_of("<t>Tom &amp; Jerry</t>"), "Tom & Jerry");
        assert_eq!(text_of("<t>caf&#233; &#x2014; x</t>"), "café — x");
        assert_eq!(text_of("<t><![CDATA[<b>bold</b>]]></t>"), "<b>bold</b>");
    }

    #[test]
    fn test_attribute_lookup_ignores_prefix() {
        let mut reader = Reader::from_str(r#"<atom:link rel="alternate" atom:href="https://pub.com/a?x=1&amp;y=2"/>"#);
        let Event::Empty(e) = reader.read_event().unwrap() else {
            panic!("expected empty element");
        };
        assert_eq!(attribute(&e, "href").as_deref(), Some("https://pub.com/a?x=1&y=2"));
        assert_eq!(attribute(&e, "rel").as_deref(), Some("alternate"));
        assert_eq!(attribute(&e, "type"), None);
    }

    #[test]
    fn test_reference_resolution() {
        assert_eq!(resolve_reference("lt").as_deref(), Some("<"));
        assert_eq!(resolve_reference("#65").as_deref(), Some("A"));
        assert_eq!(resolve_reference("nbsp"), None);
    }
}
