//! Archive metadata extraction.
//!
//! XVA archives carry an `ova.xml` member describing the exported VM in an
//! XML-RPC style record store. The member itself is picked up during the
//! indexing pass ([`crate::index::DiskIndex::scan_with_metadata`]); only the
//! display name is pulled out here, for informational output.

use quick_xml::events::Event;
use quick_xml::Reader;

/// Conventional name of the VM metadata member.
pub const METADATA_NAME: &str = "ova.xml";

/// Extracts the VM display name (`name__label`) from `ova.xml` content.
///
/// Absence of the field, or unparsable XML, yields `None`; a missing name
/// is not an error.
pub fn display_name(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);

    let mut in_name = false;
    let mut in_value = false;
    let mut armed = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"name" => in_name = true,
                b"value" => in_value = true,
                _ => {}
            },
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"name" => in_name = false,
                b"value" => in_value = false,
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let text = t.unescape().ok()?.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if in_name {
                    armed = text == "name__label";
                } else if armed && in_value {
                    return Some(text);
                }
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}
