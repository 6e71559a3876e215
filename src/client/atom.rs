//! Atom entries exchanged with the deposit API
//!
//! Outgoing: the CodeMeta metadata of a new deposit, as an Atom entry.
//! Incoming: deposit receipts and status documents, flattened into a
//! [`RawResponse`] keyed by element local name (`deposit_id`,
//! `deposit_status`, `deposit_swh_id`, ...) plus `link:{rel}` entries.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::RawResponse;
use crate::error::DepositError;
use crate::metadata::{DepositMetadata, Person};

pub const ATOM_NS: &str = "http://www.w3.org/2005/Atom";
pub const CODEMETA_NS: &str = "https://doi.org/10.5063/SCHEMA/CODEMETA-2.0";
pub const SWH_NS: &str = "https://www.softwareheritage.org/schema/2018/deposit";

/// Render deposit metadata as an Atom entry document
pub fn encode_entry(meta: &DepositMetadata) -> String {
    let mut xml = String::with_capacity(1024);
    xml.push_str(r#"<?xml version="1.0" encoding="utf-8"?>"#);
    xml.push_str(&format!(
        r#"<entry xmlns="{}" xmlns:codemeta="{}" xmlns:swh="{}">"#,
        ATOM_NS, CODEMETA_NS, SWH_NS
    ));

    element(&mut xml, "title", &meta.title);
    element(&mut xml, "codemeta:name", &meta.title);

    for author in &meta.authors {
        person(&mut xml, "codemeta:author", author);
    }
    for contributor in &meta.contributors {
        person(&mut xml, "codemeta:contributor", contributor);
    }

    if let Some(date) = &meta.date_created {
        element(&mut xml, "codemeta:dateCreated", date);
    }
    if let Some(date) = &meta.date_published {
        element(&mut xml, "codemeta:datePublished", date);
    }

    for license in &meta.licenses {
        xml.push_str("<codemeta:license>");
        element(&mut xml, "codemeta:name", license.name());
        element(&mut xml, "codemeta:url", &license.url());
        xml.push_str("</codemeta:license>");
    }

    if let Some(description) = &meta.description {
        element(&mut xml, "codemeta:description", description);
    }
    if let Some(version) = &meta.version {
        element(&mut xml, "codemeta:softwareVersion", version);
    }
    if let Some(repo) = &meta.code_repository {
        element(&mut xml, "codemeta:codeRepository", repo);
    }
    for lang in &meta.programming_languages {
        element(&mut xml, "codemeta:programmingLanguage", lang);
    }
    for platform in &meta.runtime_platforms {
        element(&mut xml, "codemeta:runtimePlatform", platform);
    }
    for os in &meta.operating_systems {
        element(&mut xml, "codemeta:operatingSystem", os);
    }
    if let Some(status) = &meta.development_status {
        element(&mut xml, "codemeta:developmentStatus", status);
    }

    if let Some(origin) = &meta.origin_url {
        xml.push_str(&format!(
            r#"<swh:deposit><swh:create_origin><swh:origin url="{}"/></swh:create_origin></swh:deposit>"#,
            escape(origin)
        ));
    }

    xml.push_str("</entry>");
    xml
}

fn element(out: &mut String, tag: &str, value: &str) {
    out.push_str(&format!("<{tag}>{}</{tag}>", escape(value), tag = tag));
}

fn person(out: &mut String, tag: &str, p: &Person) {
    out.push_str(&format!("<{}>", tag));
    element(out, "codemeta:name", &p.name);
    if let Some(orcid) = p.orcid_url() {
        element(out, "codemeta:id", &orcid);
    }
    for affiliation in &p.affiliations {
        element(out, "codemeta:affiliation", affiliation);
    }
    out.push_str(&format!("</{}>", tag));
}

/// Flatten an Atom response body. Empty bodies give an empty map.
pub fn parse_entry(body: &str) -> Result<RawResponse, DepositError> {
    let mut out = RawResponse::new();
    if body.trim().is_empty() {
        return Ok(out);
    }

    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let name = local_name(e);
                if name == "link" {
                    collect_link(e, &mut out)?;
                }
                stack.push(name);
                text.clear();
            }
            Ok(Event::Empty(ref e)) => {
                if local_name(e) == "link" {
                    collect_link(e, &mut out)?;
                }
                text.clear();
            }
            Ok(Event::Text(ref t)) => {
                let unescaped = t
                    .unescape()
                    .map_err(|e| DepositError::Deserialize(format!("bad text node: {}", e)))?;
                text.push_str(&unescaped);
            }
            Ok(Event::CData(c)) => {
                text.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(Event::End(_)) => {
                if let Some(name) = stack.pop() {
                    let value = text.trim();
                    if !value.is_empty() {
                        out.entry(name).or_insert_with(|| value.to_string());
                    }
                }
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(DepositError::Deserialize(format!(
                    "invalid XML at position {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(DepositError::Deserialize(format!(
            "truncated response, <{}> never closed",
            stack.join("><")
        )));
    }
    if out.is_empty() {
        return Err(DepositError::Deserialize("response has no entry fields".into()));
    }

    Ok(out)
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn collect_link(e: &BytesStart, out: &mut RawResponse) -> Result<(), DepositError> {
    let mut rel = None;
    let mut href = None;
    for attr in e.attributes() {
        let attr = attr.map_err(|e| DepositError::Deserialize(format!("bad attribute: {}", e)))?;
        let value = attr
            .unescape_value()
            .map_err(|e| DepositError::Deserialize(format!("bad attribute value: {}", e)))?
            .into_owned();
        match attr.key.local_name().as_ref() {
            b"rel" => rel = Some(value),
            b"href" => href = Some(value),
            _ => {}
        }
    }
    if let (Some(rel), Some(href)) = (rel, href) {
        out.entry(format!("link:{}", rel)).or_insert(href);
    }
    Ok(())
}
