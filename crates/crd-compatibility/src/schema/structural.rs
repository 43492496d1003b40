//! A compiled view of a CustomResourceDefinition version schema.
//!
//! [`StructuralSchema`] only keeps what is needed to decide which fields of an object are known:
//! types, properties, items and the different ways to allow unknown fields. Value validations
//! (`enum`, `pattern`, `allOf`, ...) are dropped.
use std::{collections::BTreeMap, str::FromStr};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    JSONSchemaProps, JSONSchemaPropsOrArray, JSONSchemaPropsOrBool,
};
use snafu::{ResultExt, Snafu, ensure};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "schema at {path:?} has no type and neither preserves unknown fields nor is an int-or-string"
    ))]
    MissingType { path: String },

    #[snafu(display("schema at {path:?} has unsupported type {type_:?}"))]
    UnsupportedType {
        source: strum::ParseError,
        path: String,
        type_: String,
    },

    #[snafu(display("schema at {path:?} uses a list of items schemas, which is not structural"))]
    TupleItems { path: String },

    #[snafu(display(
        "schema at {path:?} sets both properties and additionalProperties, which are mutually exclusive"
    ))]
    PropertiesWithAdditionalProperties { path: String },
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Integer,
    Number,
    Boolean,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StructuralSchema {
    /// `None` for int-or-string and untyped nodes preserving unknown fields.
    pub type_: Option<SchemaType>,
    pub properties: BTreeMap<String, StructuralSchema>,
    pub items: Option<Box<StructuralSchema>>,
    pub additional_properties: Option<Box<StructuralSchema>>,

    /// `x-kubernetes-preserve-unknown-fields`
    pub preserve_unknown_fields: bool,

    /// `x-kubernetes-int-or-string`
    pub int_or_string: bool,
}

impl StructuralSchema {
    /// Compiles the given OpenAPI schema, usually the `openAPIV3Schema` of a CRD version.
    pub fn compile(schema: &JSONSchemaProps) -> Result<Self, Error> {
        Self::compile_at(schema, "^")
    }

    fn compile_at(schema: &JSONSchemaProps, path: &str) -> Result<Self, Error> {
        let preserve_unknown_fields = schema.x_kubernetes_preserve_unknown_fields == Some(true);
        let int_or_string = schema.x_kubernetes_int_or_string == Some(true);

        let type_ = match schema.type_.as_deref() {
            None | Some("") => {
                ensure!(
                    preserve_unknown_fields || int_or_string,
                    MissingTypeSnafu { path }
                );
                None
            }
            Some(type_) => Some(
                SchemaType::from_str(type_).with_context(|_| UnsupportedTypeSnafu { path, type_ })?,
            ),
        };

        let properties = schema
            .properties
            .iter()
            .flatten()
            .map(|(name, property)| {
                Self::compile_at(property, &format!("{path}.{name}"))
                    .map(|compiled| (name.clone(), compiled))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let items = match &schema.items {
            None => None,
            Some(JSONSchemaPropsOrArray::Schema(items)) => {
                Some(Box::new(Self::compile_at(items, &format!("{path}[*]"))?))
            }
            Some(JSONSchemaPropsOrArray::Schemas(_)) => return TupleItemsSnafu { path }.fail(),
        };

        let additional_properties = match &schema.additional_properties {
            None | Some(JSONSchemaPropsOrBool::Bool(false)) => None,
            Some(JSONSchemaPropsOrBool::Bool(true)) => Some(Box::new(Self {
                preserve_unknown_fields: true,
                ..Self::default()
            })),
            Some(JSONSchemaPropsOrBool::Schema(additional_properties)) => Some(Box::new(
                Self::compile_at(additional_properties, &format!("{path}.*"))?,
            )),
        };

        ensure!(
            properties.is_empty() || additional_properties.is_none(),
            PropertiesWithAdditionalPropertiesSnafu { path }
        );

        Ok(Self {
            type_,
            properties,
            items,
            additional_properties,
            preserve_unknown_fields,
            int_or_string,
        })
    }

    /// Whether fields which are not listed in [`Self::properties`] are kept.
    pub fn permits_unknown_fields(&self) -> bool {
        self.preserve_unknown_fields || self.additional_properties.is_some()
    }
}
