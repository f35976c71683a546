use crate::imagehandler::ImageFileSystem;
use crate::reconciler::ReconcileEngine;
use crate::secrets::KubeSecretSource;
use std::sync::Arc;

pub struct ControllerContext {
    pub(crate) kube_client: kube::Client,
    pub(crate) engine: ReconcileEngine<KubeSecretSource>,
}

#[derive(Clone)]
pub struct WebserverState {
    pub(crate) filesystem: Arc<ImageFileSystem>,
}
