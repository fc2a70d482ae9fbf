use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use roxmltree::{Document, Node};

use crate::{ManifestError, PackageIdentity, PackageVersion};

pub const MANIFEST_FILE_NAME: &str = "AppxManifest.xml";

/// The subset of `AppxManifest.xml` the package manager consumes. Elements
/// are matched by local name so any manifest namespace revision is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppxManifest {
    pub identity: PackageIdentity,
    pub display_name: Option<String>,
    pub publisher_display_name: Option<String>,
    pub logo: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub applications: Vec<ManifestApplication>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestApplication {
    pub id: String,
    pub executable: Option<String>,
}

impl AppxManifest {
    pub fn from_xml_str(input: &str) -> Result<Self, ManifestError> {
        let document = Document::parse(input)?;
        let root = document.root_element();

        let identity_node =
            find_element(root, "Identity").ok_or(ManifestError::MissingElement("Identity"))?;
        let name = required_attribute(identity_node, "Identity", "Name")?;
        let version = PackageVersion::parse(required_attribute(identity_node, "Identity", "Version")?)?;
        let publisher = required_attribute(identity_node, "Identity", "Publisher")?;
        let identity = PackageIdentity::new(
            name,
            version,
            identity_node.attribute("ProcessorArchitecture"),
            identity_node.attribute("ResourceId"),
            publisher,
        )?;

        let properties = find_element(root, "Properties");
        let property_text = |element: &str| {
            properties
                .and_then(|node| find_element(node, element))
                .and_then(|node| node.text())
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty())
        };

        let capabilities = root
            .descendants()
            .filter(|node| node.is_element() && node.tag_name().name() == "Capability")
            .filter_map(|node| node.attribute("Name"))
            .map(str::to_string)
            .collect();

        let applications = root
            .descendants()
            .filter(|node| node.is_element() && node.tag_name().name() == "Application")
            .map(|node| {
                Ok(ManifestApplication {
                    id: required_attribute(node, "Application", "Id")?.to_string(),
                    executable: node.attribute("Executable").map(str::to_string),
                })
            })
            .collect::<Result<Vec<_>, ManifestError>>()?;

        Ok(Self {
            identity,
            display_name: property_text("DisplayName"),
            publisher_display_name: property_text("PublisherDisplayName"),
            logo: property_text("Logo"),
            capabilities,
            applications,
        })
    }

    pub fn read_from_dir(package_root: &Path) -> Result<Self, ManifestError> {
        let path = package_root.join(MANIFEST_FILE_NAME);
        let content = fs::read_to_string(&path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_xml_str(&content)
    }

    pub fn primary_application(&self) -> Option<&ManifestApplication> {
        self.applications.first()
    }
}

fn find_element<'a, 'input>(node: Node<'a, 'input>, local_name: &str) -> Option<Node<'a, 'input>> {
    node.descendants()
        .find(|candidate| candidate.is_element() && candidate.tag_name().name() == local_name)
}

fn required_attribute<'a>(
    node: Node<'a, '_>,
    element: &'static str,
    attribute: &'static str,
) -> Result<&'a str, ManifestError> {
    node.attribute(attribute)
        .filter(|value| !value.is_empty())
        .ok_or(ManifestError::MissingAttribute { element, attribute })
}
