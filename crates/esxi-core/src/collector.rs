//! Paginated object enumeration through the property collector.
//!
//! A recursive container view over the root folder selects every object of
//! one type; `RetrievePropertiesEx` returns the first page and
//! `ContinueRetrievePropertiesEx` follows the continuation token until the
//! server stops returning one.

use std::collections::HashMap;

use crate::config::CollectorOptions;
use crate::error::{Error, Result};
use crate::moref::ManagedObjectRef;
use crate::session::{ServiceContent, Session};
use crate::soap::{Transport, XmlNode};

/// A retrieved property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// A value without child elements, unwrapped to its text.
    Scalar(String),
    /// A structured value, kept as received.
    Struct(XmlNode),
}

impl PropertyValue {
    fn from_val(val: &XmlNode) -> Self {
        if val.is_scalar() {
            PropertyValue::Scalar(val.text.clone())
        } else {
            PropertyValue::Struct(val.clone())
        }
    }

    /// The scalar text, if this is a scalar.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Scalar(s) => Some(s),
            PropertyValue::Struct(_) => None,
        }
    }

    /// The structured value, if this is a structure.
    pub fn as_node(&self) -> Option<&XmlNode> {
        match self {
            PropertyValue::Scalar(_) => None,
            PropertyValue::Struct(node) => Some(node),
        }
    }
}

/// Properties of one object, keyed by property name.
pub type PropertyMap = HashMap<String, PropertyValue>;

/// Properties of every enumerated object.
pub type PropertySet = HashMap<ManagedObjectRef, PropertyMap>;

impl<T: Transport> Session<T> {
    /// Enumerate every object of `object_type` with the requested properties.
    pub fn search(&self, object_type: &str, properties: &[&str]) -> Result<PropertySet> {
        let service = self.service_content()?;
        retrieve(
            |method, args| self.execute(method, args),
            &service,
            object_type,
            properties,
            self.collector_options(),
        )
    }
}

/// Run the container-view enumeration through `execute`.
pub(crate) fn retrieve<F>(
    execute: F,
    service: &ServiceContent,
    object_type: &str,
    properties: &[&str],
    options: CollectorOptions,
) -> Result<PropertySet>
where
    F: Fn(&str, &[XmlNode]) -> Result<XmlNode>,
{
    let created = execute(
        "CreateContainerView",
        &[
            service.view_manager.to_node("_this"),
            service.root_folder.to_node("container"),
            XmlNode::leaf("type", object_type),
            XmlNode::leaf("recursive", "true"),
        ],
    )?;
    let view = created
        .child("returnval")
        .and_then(ManagedObjectRef::from_node)
        .ok_or_else(|| Error::not_found(format!("container view for {}", object_type)))?;

    let outcome = collect_pages(&execute, service, &view, object_type, properties, options);

    if let Err(error) = execute("DestroyView", &[view.to_node("_this")]) {
        tracing::warn!(%view, %error, "failed to destroy container view");
    }

    outcome
}

fn collect_pages<F>(
    execute: &F,
    service: &ServiceContent,
    view: &ManagedObjectRef,
    object_type: &str,
    properties: &[&str],
    options: CollectorOptions,
) -> Result<PropertySet>
where
    F: Fn(&str, &[XmlNode]) -> Result<XmlNode>,
{
    let collector = service.property_collector.to_node("_this");
    let mut objects = PropertySet::new();

    let mut response = execute(
        "RetrievePropertiesEx",
        &[
            collector.clone(),
            filter_spec(view, object_type, properties),
            XmlNode::new("options"),
        ],
    )?;
    let mut pages = 1;

    loop {
        let token = merge_page(&response, &mut objects);
        let Some(token) = token else {
            break;
        };

        if pages >= options.max_pages {
            return Err(Error::PaginationLimit {
                object_type: object_type.to_string(),
                pages,
            });
        }

        tracing::debug!(object_type, pages, "continuing property retrieval");
        response = execute(
            "ContinueRetrievePropertiesEx",
            &[collector.clone(), XmlNode::leaf("token", token)],
        )?;
        pages += 1;
    }

    tracing::debug!(object_type, pages, objects = objects.len(), "property retrieval done");
    Ok(objects)
}

/// Merge one page into `objects`; returns the continuation token, if any.
fn merge_page(response: &XmlNode, objects: &mut PropertySet) -> Option<String> {
    // an empty result set comes back without any returnval
    let result = response.child("returnval")?;

    for object in result.children_named("objects") {
        let Some(obj) = object.child("obj").and_then(ManagedObjectRef::from_node) else {
            continue;
        };
        let props = objects.entry(obj).or_default();
        for prop in object.children_named("propSet") {
            let (Some(name), Some(val)) = (prop.text_at(&["name"]), prop.child("val")) else {
                continue;
            };
            props.insert(name.to_string(), PropertyValue::from_val(val));
        }
    }

    result
        .text_at(&["token"])
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn filter_spec(view: &ManagedObjectRef, object_type: &str, properties: &[&str]) -> XmlNode {
    let prop_spec = properties.iter().fold(
        XmlNode::new("propSet").with_child(XmlNode::leaf("type", object_type)),
        |spec, name| spec.with_child(XmlNode::leaf("pathSet", *name)),
    );

    let traversal = XmlNode::new("selectSet")
        .with_attr("xsi:type", "TraversalSpec")
        .with_child(XmlNode::leaf("name", "traverseEntities"))
        .with_child(XmlNode::leaf("type", "ContainerView"))
        .with_child(XmlNode::leaf("path", "view"))
        .with_child(XmlNode::leaf("skip", "false"));

    let object_spec = XmlNode::new("objectSet")
        .with_child(view.to_node("obj"))
        .with_child(XmlNode::leaf("skip", "true"))
        .with_child(traversal);

    XmlNode::new("specSet")
        .with_child(prop_spec)
        .with_child(object_spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soap::parse_element;

    #[test]
    fn test_filter_spec_shape() {
        let view = ManagedObjectRef::new("ContainerView", "session[1]view");
        let spec = filter_spec(&view, "VirtualMachine", &["name", "config"]);

        let prop = spec.child("propSet").unwrap();
        assert_eq!(prop.text_at(&["type"]), Some("VirtualMachine"));
        let paths: Vec<_> = prop.children_named("pathSet").map(|p| p.text.as_str()).collect();
        assert_eq!(paths, ["name", "config"]);

        let objects = spec.child("objectSet").unwrap();
        assert_eq!(objects.child("obj").and_then(ManagedObjectRef::from_node), Some(view));
        let select = objects.child("selectSet").unwrap();
        assert_eq!(select.attr("xsi:type"), Some("TraversalSpec"));
        assert_eq!(select.text_at(&["path"]), Some("view"));
    }

    #[test]
    fn test_merge_page_unwraps_scalars_keeps_structs() {
        let response = parse_element(
            r#"<RetrievePropertiesExResponse>
                 <returnval>
                   <token>page-2</token>
                   <objects>
                     <obj type="VirtualMachine">1</obj>
                     <propSet><name>name</name><val xsi:type="xsd:string">web</val></propSet>
                     <propSet><name>runtime</name><val xsi:type="VirtualMachineRuntimeInfo"><powerState>poweredOn</powerState></val></propSet>
                   </objects>
                 </returnval>
               </RetrievePropertiesExResponse>"#,
        )
        .unwrap();

        let mut objects = PropertySet::new();
        let token = merge_page(&response, &mut objects);
        assert_eq!(token.as_deref(), Some("page-2"));

        let props = &objects[&ManagedObjectRef::new("VirtualMachine", "1")];
        assert_eq!(props["name"].as_str(), Some("web"));
        let runtime = props["runtime"].as_node().unwrap();
        assert_eq!(runtime.text_at(&["powerState"]), Some("poweredOn"));
    }

    #[test]
    fn test_merge_page_without_returnval_is_empty_last_page() {
        let response = parse_element("<RetrievePropertiesExResponse/>").unwrap();
        let mut objects = PropertySet::new();
        assert_eq!(merge_page(&response, &mut objects), None);
        assert!(objects.is_empty());
    }
}
