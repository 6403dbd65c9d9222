//! Streaming attribute rewriter.
//!
//! Copies an XML document event by event from a reader to a writer. Only
//! attribute values selected by an [`AttributeRewriter`] are replaced; every
//! other event (text, CDATA, comments, processing instructions, doctype,
//! whitespace) is written back from its raw bytes, and elements without a
//! patched attribute are written back unchanged.
//!
//! The copy is event-exact, not byte-exact, in a few places:
//! - an element with a patched attribute is rebuilt, so its attributes are
//!   separated by single spaces, quoted with `"`, and an empty element closes
//!   with `/>` without a preceding space
//! - a leading UTF-8 byte order mark is dropped
//! - runs of whitespace inside a doctype or an end tag are collapsed

use std::borrow::Cow;
use std::io::{BufRead, Write};

use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};

use crate::ResizeError;

/// Which element/attribute pair names an external file
#[derive(Debug, Clone)]
pub struct RewriteConfig {
    pub reference_element: String,
    pub reference_attribute: String,
}

impl RewriteConfig {
    /// `<file name="...">` as used by Spriter `.scml` documents
    pub fn spriter() -> Self {
        Self {
            reference_element: "file".to_string(),
            reference_attribute: "name".to_string(),
        }
    }
}

/// Callbacks driving [`rewrite_document`].
pub trait AttributeRewriter {
    /// Produced by [`on_reference`](Self::on_reference) and handed to the
    /// transforms of that same element only.
    type Context;

    /// Called when a reference element carries a non-empty reference
    /// attribute, before any of the element's attributes are written.
    /// Returning an error aborts the rewrite.
    fn on_reference(&mut self, element: &str, reference: &str) -> Result<Self::Context, ResizeError>;

    fn should_transform(&self, element: &str, attribute: &str, value: &str) -> bool;

    /// New (unescaped) value for an attribute accepted by `should_transform`
    fn transform(
        &self,
        context: Option<&Self::Context>,
        element: &str,
        attribute: &str,
        value: &str,
    ) -> String;
}

/// Attribute as read from the input
struct RawAttribute {
    key: Vec<u8>,
    raw: Vec<u8>,
    value: String,
}

/// Rewrite `input` into `output`, returning the writer once the whole
/// document has been copied.
pub fn rewrite_document<R, W, H>(
    input: R,
    output: W,
    config: &RewriteConfig,
    rewriter: &mut H,
) -> Result<W, ResizeError>
where
    R: BufRead,
    W: Write,
    H: AttributeRewriter,
{
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(false);

    let mut writer = Writer::new(output);
    let mut buf = Vec::new();
    let mut depth: usize = 0;

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            ResizeError::DocumentParse(format!(
                "at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;

        match event {
            Event::Start(element) => {
                depth += 1;
                let patched = patch_element(&element, config, rewriter)?;
                match patched {
                    Some(patched) => write(&mut writer, Event::Start(patched))?,
                    None => write(&mut writer, Event::Start(element))?,
                }
            }
            Event::Empty(element) => {
                let patched = patch_element(&element, config, rewriter)?;
                match patched {
                    Some(patched) => write(&mut writer, Event::Empty(patched))?,
                    None => write(&mut writer, Event::Empty(element))?,
                }
            }
            Event::End(element) => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    ResizeError::DocumentParse("unmatched closing tag".to_string())
                })?;
                write(&mut writer, Event::End(element))?;
            }
            Event::Eof => break,
            // Text, CDATA, comments, PIs, doctype and the declaration are
            // copied through untouched
            other => write(&mut writer, other)?,
        }

        buf.clear();
    }

    if depth != 0 {
        return Err(ResizeError::DocumentParse(format!(
            "unexpected end of document with {} unclosed element(s)",
            depth
        )));
    }

    Ok(writer.into_inner())
}

fn write<W: Write>(writer: &mut Writer<W>, event: Event<'_>) -> Result<(), ResizeError> {
    writer
        .write_event(event)
        .map_err(ResizeError::DocumentWrite)
}

fn utf8<'a>(bytes: &'a [u8], what: &str) -> Result<&'a str, ResizeError> {
    std::str::from_utf8(bytes)
        .map_err(|e| ResizeError::DocumentParse(format!("{} is not valid UTF-8: {}", what, e)))
}

/// Run the callbacks for one element. Returns the rebuilt element when at
/// least one attribute was transformed.
fn patch_element<H: AttributeRewriter>(
    element: &BytesStart<'_>,
    config: &RewriteConfig,
    rewriter: &mut H,
) -> Result<Option<BytesStart<'static>>, ResizeError> {
    let local_name = element.local_name();
    let element_name = utf8(local_name.as_ref(), "element name")?;

    let mut attributes = Vec::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| ResizeError::DocumentParse(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| ResizeError::DocumentParse(e.to_string()))?
            .into_owned();
        attributes.push(RawAttribute {
            key: attr.key.as_ref().to_vec(),
            raw: attr.value.to_vec(),
            value,
        });
    }

    let context = if element_name == config.reference_element {
        let reference = attributes
            .iter()
            .find(|a| a.key == config.reference_attribute.as_bytes())
            .map(|a| a.value.as_str())
            .filter(|v| !v.is_empty());
        match reference {
            Some(reference) => Some(rewriter.on_reference(element_name, reference)?),
            None => None,
        }
    } else {
        None
    };

    let mut replacements: Vec<Option<String>> = Vec::with_capacity(attributes.len());
    for attr in &attributes {
        let key = utf8(&attr.key, "attribute name")?;
        if rewriter.should_transform(element_name, key, &attr.value) {
            let new_value = rewriter.transform(context.as_ref(), element_name, key, &attr.value);
            log::debug!("    <{} {}> {} -> {}", element_name, key, attr.value, new_value);
            replacements.push(Some(new_value));
        } else {
            replacements.push(None);
        }
    }

    if replacements.iter().all(Option::is_none) {
        return Ok(None);
    }

    let name = utf8(element.name().as_ref(), "element name")?.to_string();
    let mut patched = BytesStart::new(name);
    for (attr, replacement) in attributes.iter().zip(replacements) {
        let value: Cow<'_, [u8]> = match replacement {
            Some(new_value) => Cow::Owned(escape(&new_value)),
            // Raw bytes are only safe to re-quote with `"` if they contain none
            None if !attr.raw.contains(&b'"') => Cow::Borrowed(attr.raw.as_slice()),
            None => Cow::Owned(escape(&attr.value)),
        };
        patched.push_attribute(Attribute {
            key: QName(attr.key.as_slice()),
            value,
        });
    }

    Ok(Some(patched))
}

fn escape(value: &str) -> Vec<u8> {
    quick_xml::escape::escape(value).into_owned().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Never transforms anything
    struct Identity {
        references: Vec<String>,
    }

    impl AttributeRewriter for Identity {
        type Context = ();

        fn on_reference(&mut self, _element: &str, reference: &str) -> Result<(), ResizeError> {
            self.references.push(reference.to_string());
            Ok(())
        }

        fn should_transform(&self, _element: &str, _attribute: &str, _value: &str) -> bool {
            false
        }

        fn transform(&self, _: Option<&()>, _: &str, _: &str, value: &str) -> String {
            value.to_string()
        }
    }

    /// Upper-cases `x` attributes and records call order
    struct Upper {
        log: RefCell<Vec<String>>,
    }

    impl AttributeRewriter for Upper {
        type Context = String;

        fn on_reference(&mut self, element: &str, reference: &str) -> Result<String, ResizeError> {
            self.log.borrow_mut().push(format!("open {} {}", element, reference));
            Ok(reference.to_uppercase())
        }

        fn should_transform(&self, _element: &str, attribute: &str, _value: &str) -> bool {
            attribute == "x" || attribute == "ref"
        }

        fn transform(&self, context: Option<&String>, element: &str, attribute: &str, value: &str) -> String {
            self.log.borrow_mut().push(format!("attr {} {}", element, attribute));
            match (attribute, context) {
                ("ref", Some(ctx)) => ctx.clone(),
                _ => value.to_uppercase(),
            }
        }
    }

    fn rewrite_str<H: AttributeRewriter>(input: &str, rewriter: &mut H) -> Result<String, ResizeError> {
        let out = rewrite_document(input.as_bytes(), Vec::new(), &RewriteConfig::spriter(), rewriter)?;
        Ok(String::from_utf8(out).unwrap())
    }

    const DOCUMENT: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n\
<!DOCTYPE spriter_data>\n\
<!-- generated -->\n\
<?app keep=\"me\"?>\n\
<spriter_data scml_version=\"1.0\"  generator='BrashMonkey &amp; Co'>\n\
\t<folder id=\"0\">\n\
\t\t<file id=\"0\" name=\"parts/head.png\" width=\"128\" height=\"64\"/>\n\
\t\t<file id=\"1\" name=\"\" width=\"1\" height=\"2\" />\n\
\t</folder>\n\
\t<note><![CDATA[ <raw> & stuff ]]> text &lt;kept&gt; </note>\n\
</spriter_data>\n";

    #[test]
    fn test_identity_rewrite_is_byte_exact() {
        let mut identity = Identity { references: Vec::new() };
        let out = rewrite_str(DOCUMENT, &mut identity).unwrap();
        assert_eq!(out, DOCUMENT);
        // Empty reference values do not trigger the hook
        assert_eq!(identity.references, vec!["parts/head.png".to_string()]);
    }

    #[test]
    fn test_hook_runs_before_attributes_and_context_is_per_element() {
        let input = r#"<root><file name="a.png" ref="?" x="left"/><file ref="?" x="b"/><other x="c">t</other></root>"#;
        let mut upper = Upper { log: RefCell::new(Vec::new()) };
        let out = rewrite_str(input, &mut upper).unwrap();
        assert_eq!(
            out,
            r#"<root><file name="a.png" ref="A.PNG" x="LEFT"/><file ref="?" x="B"/><other x="C">t</other></root>"#
        );
        assert_eq!(
            upper.log.into_inner(),
            vec![
                "open file a.png",
                "attr file ref",
                "attr file x",
                "attr file ref",
                "attr file x",
                "attr other x",
            ]
        );
    }

    #[test]
    fn test_patched_values_are_escaped() {
        let input = r#"<a x="1"/>"#;
        struct Quote;
        impl AttributeRewriter for Quote {
            type Context = ();
            fn on_reference(&mut self, _: &str, _: &str) -> Result<(), ResizeError> {
                Ok(())
            }
            fn should_transform(&self, _: &str, attribute: &str, _: &str) -> bool {
                attribute == "x"
            }
            fn transform(&self, _: Option<&()>, _: &str, _: &str, _: &str) -> String {
                "\"<&>\"".to_string()
            }
        }
        let out = rewrite_str(input, &mut Quote).unwrap();
        assert_eq!(out, r#"<a x="&quot;&lt;&amp;&gt;&quot;"/>"#);
    }

    #[test]
    fn test_single_quoted_untouched_attribute_survives_rebuild() {
        let input = r#"<object x="1" label='say "hi"'/>"#;
        let mut upper = Upper { log: RefCell::new(Vec::new()) };
        let out = rewrite_str(input, &mut upper).unwrap();
        assert_eq!(out, r#"<object x="1" label="say &quot;hi&quot;"/>"#);
    }

    #[test]
    fn test_empty_and_open_elements_keep_their_shape() {
        let input = r#"<a><b x="q"></b><c x="r"/></a>"#;
        let mut upper = Upper { log: RefCell::new(Vec::new()) };
        let out = rewrite_str(input, &mut upper).unwrap();
        assert_eq!(out, r#"<a><b x="Q"></b><c x="R"/></a>"#);
    }

    #[test]
    fn test_rebuilt_element_normalizes_layout() {
        let input = "<a>\n<b\n  x=\"1\"\n  y='2' />\n<c  x='3' ></c>\n</a>";
        let mut upper = Upper { log: RefCell::new(Vec::new()) };
        let out = rewrite_str(input, &mut upper).unwrap();
        assert_eq!(out, "<a>\n<b x=\"1\" y=\"2\"/>\n<c x=\"3\"></c>\n</a>");
    }

    #[test]
    fn test_bom_and_doctype_spacing_are_normalized() {
        let mut identity = Identity { references: Vec::new() };
        assert_eq!(rewrite_str("\u{feff}<a/>", &mut identity).unwrap(), "<a/>");
        assert_eq!(
            rewrite_str("<!DOCTYPE  a>\n<a/>", &mut identity).unwrap(),
            "<!DOCTYPE a>\n<a/>"
        );
    }

    #[test]
    fn test_write_failure_is_not_a_parse_error() {
        #[derive(Debug)]
        struct DiskFull;
        impl Write for DiskFull {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut identity = Identity { references: Vec::new() };
        let err = rewrite_document(
            "<a/>".as_bytes(),
            DiskFull,
            &RewriteConfig::spriter(),
            &mut identity,
        )
        .unwrap_err();
        assert!(matches!(err, ResizeError::DocumentWrite(_)));
    }

    #[test]
    fn test_mismatched_tags_fail() {
        let mut identity = Identity { references: Vec::new() };
        let err = rewrite_str("<a><b></a>", &mut identity).unwrap_err();
        assert!(matches!(err, ResizeError::DocumentParse(_)));
    }

    #[test]
    fn test_truncated_document_fails() {
        let mut identity = Identity { references: Vec::new() };
        let err = rewrite_str("<a><b x=\"1\"/>", &mut identity).unwrap_err();
        assert!(matches!(err, ResizeError::DocumentParse(_)));

        let err = rewrite_str("<a><file name=\"x.png", &mut identity).unwrap_err();
        assert!(matches!(err, ResizeError::DocumentParse(_)));
    }

    #[test]
    fn test_hook_error_aborts() {
        struct Fail;
        impl AttributeRewriter for Fail {
            type Context = ();
            fn on_reference(&mut self, _: &str, _: &str) -> Result<(), ResizeError> {
                Err(ResizeError::Cancelled)
            }
            fn should_transform(&self, _: &str, _: &str, _: &str) -> bool {
                false
            }
            fn transform(&self, _: Option<&()>, _: &str, _: &str, value: &str) -> String {
                value.to_string()
            }
        }
        let err = rewrite_str(r#"<a><file name="x.png"/></a>"#, &mut Fail).unwrap_err();
        assert!(matches!(err, ResizeError::Cancelled));
    }
}
