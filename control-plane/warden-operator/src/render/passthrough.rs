use super::{Render, RenderError, RenderResult, RenderedResource};
use crate::config::Registry;

/// Objects built by a driver and applied verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct PassthroughConfig {
    pub component: String,
    pub objects: Vec<RenderedResource>,
    pub delete: Vec<RenderedResource>,
}

impl Render for PassthroughConfig {
    fn component(&self) -> &str {
        &self.component
    }

    /// Objects keep the caller's order, which must already respect tiers.
    fn render(&self, _reg: &Registry) -> Result<RenderResult, RenderError> {
        let result = RenderResult {
            to_create: self.objects.clone(),
            to_delete: self.delete.clone(),
        };
        result.validate()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Namespace, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn namespace() -> RenderedResource {
        Namespace {
            metadata: ObjectMeta {
                name: Some("extra".into()),
                ..Default::default()
            },
            ..Default::default()
        }
        .into()
    }

    fn secret() -> RenderedResource {
        Secret {
            metadata: ObjectMeta {
                name: Some("extra-tls".into()),
                namespace: Some("extra".into()),
                ..Default::default()
            },
            ..Default::default()
        }
        .into()
    }

    fn config(objects: Vec<RenderedResource>) -> PassthroughConfig {
        PassthroughConfig {
            component: "extra".into(),
            objects,
            delete: Vec::new(),
        }
    }

    #[test]
    fn objects_are_rendered_in_the_given_order() {
        let result = config(vec![namespace(), secret()])
            .render(&Registry::default())
            .unwrap();
        assert_eq!(result.to_create, vec![namespace(), secret()]);
    }

    #[test]
    fn dependent_before_dependency_is_rejected() {
        let err = config(vec![secret(), namespace()])
            .render(&Registry::default())
            .unwrap_err();
        assert!(matches!(err, RenderError::OrderingViolation { .. }));
    }
}
