// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests of the clone saga against the simulated store

use assert_matches::assert_matches;
use image_clone::clone::fsm::CloneStep;
use image_clone::config::CloneConfig;
use image_clone::error::ResourceType;
use image_clone::image::StoreImageCtx;
use image_clone::sim::{ImageOp, SimImage, SimStore, StoreOp};
use image_clone::types::{
    ImageHeader, ImageId, MirrorProvenance, ParentSpec, PoolId,
    ProtectionStatus, SnapId, SnapInfo,
};
use image_clone::{
    result_code, CloneRequest, Error, Features, ImageCtx, ImageOptions,
    IoCtx, ObjectStore, OpWorkQueue, StepHistory, StoreImageFactory,
};
use image_clone_test_utils::dev::{test_setup_log, LogContext};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use test_strategy::proptest;
use tokio::sync::oneshot;

const POOL: PoolId = PoolId(1);
const SNAP: SnapId = SnapId(8);
const PARENT_SIZE: u64 = 1 << 24;

struct Harness {
    logctx: LogContext,
    store: Arc<SimStore>,
    io_ctx: IoCtx,
    factory: Arc<StoreImageFactory>,
    work_queue: OpWorkQueue,
    config: CloneConfig,
}

impl Harness {
    fn new(test_name: &str) -> Harness {
        let logctx = test_setup_log(test_name);
        let store = Arc::new(SimStore::new(&logctx.log));
        let io_ctx = IoCtx::new(POOL, store.clone());
        let factory = Arc::new(StoreImageFactory::new(&logctx.log));
        Harness {
            logctx,
            store,
            io_ctx,
            factory,
            work_queue: OpWorkQueue::new(),
            config: CloneConfig::default(),
        }
    }

    /// Create "parent" with a protected snapshot and open it at that
    /// snapshot
    async fn store_parent(
        &self,
        features: Features,
        metadata: &[(&str, &str)],
    ) -> (ImageId, Arc<StoreImageCtx>) {
        let id = self.store.seed_image(POOL, "parent", features, PARENT_SIZE);
        self.store.seed_snapshot(POOL, &id, SNAP, "base");
        for (key, value) in metadata {
            self.store.seed_metadata(POOL, &id, key, value.as_bytes());
        }
        let mut parent =
            self.factory.image_at(&self.io_ctx, "parent", Some(SNAP));
        parent.open().await.unwrap();
        (id, Arc::new(parent))
    }

    /// Start cloning `parent` as `name` without waiting for it to finish
    fn send_clone<P: ImageCtx>(
        &self,
        parent: Arc<P>,
        name: &str,
        opts: ImageOptions,
        mirror: MirrorProvenance,
        history: &StepHistory,
    ) -> oneshot::Receiver<Result<(), Error>> {
        let (tx, rx) = oneshot::channel();
        CloneRequest::new(
            &self.logctx.log,
            self.factory.clone(),
            parent,
            &self.io_ctx,
            name,
            opts,
            mirror,
            &self.work_queue,
            &self.config,
            Box::new(move |result: Result<(), Error>| tx.send(result).unwrap()),
        )
        .with_history(history.clone())
        .send();
        rx
    }

    async fn clone_from<P: ImageCtx>(
        &self,
        parent: Arc<P>,
        opts: ImageOptions,
        mirror: MirrorProvenance,
    ) -> (Result<(), Error>, Vec<CloneStep>) {
        let history = StepHistory::new();
        let rx = self.send_clone(parent, "child", opts, mirror, &history);
        let result = rx.await.expect("completion dropped without running");
        (result, history.steps())
    }

    async fn assert_no_child(&self, parent_spec: &ParentSpec) {
        assert!(!self.store.dir_list(POOL).await.unwrap().contains_key("child"));
        assert_matches!(
            self.store.get_id(POOL, "child").await,
            Err(Error::NotFound { type_name: ResourceType::ImageId, .. })
        );
        assert!(self
            .store
            .get_children(POOL, parent_spec)
            .await
            .unwrap()
            .is_empty());
    }

    fn cleanup_successful(self) {
        self.logctx.cleanup_successful();
    }
}

fn parent_spec(parent_id: &ImageId) -> ParentSpec {
    ParentSpec { pool_id: POOL, image_id: parent_id.clone(), snap_id: SNAP }
}

fn sim_parent(features: Features) -> SimImage {
    let id = ImageId::new("simparent");
    let header = ImageHeader {
        id: id.clone(),
        size: PARENT_SIZE,
        order: 22,
        features,
        stripe_unit: 1 << 22,
        stripe_count: 1,
        data_pool: None,
        object_prefix: id.object_prefix(),
        parent: None,
        snapshots: BTreeMap::from([(
            SNAP,
            SnapInfo {
                name: "base".to_string(),
                size: PARENT_SIZE,
                protection: ProtectionStatus::Protected,
            },
        )]),
    };
    SimImage::new("simparent", POOL, header, Some(SNAP))
}

fn io(message: &str) -> Error {
    Error::Io { message: message.to_string() }
}

#[tokio::test]
async fn test_clone_success() {
    use CloneStep::*;
    let h = Harness::new("test_clone_success");
    let (parent_id, parent) =
        h.store_parent(Features::LAYERING, &[("a", "1")]).await;
    h.store.clear_calls();

    let (result, steps) =
        h.clone_from(parent, ImageOptions::default(), Default::default()).await;
    assert_eq!(result_code(&result), 0);
    assert_eq!(
        steps,
        [
            ValidateParent,
            ValidateChild,
            CreateImage,
            OpenImage,
            SetParentInHeader,
            UpdateDirChildren,
            Refresh,
            GetMetasInParent,
            SetMetasInChild,
            CloseImage,
        ]
    );
    assert_eq!(
        h.store.calls(),
        [
            StoreOp::GetId,
            StoreOp::CreateId,
            StoreOp::DirAddImage,
            StoreOp::CreateHeader,
            StoreOp::GetHeader,
            StoreOp::Watch,
            StoreOp::SetParent,
            StoreOp::AddChild,
            StoreOp::GetHeader,
            StoreOp::GetSnapProtectionStatus,
            StoreOp::MetadataList,
            StoreOp::MetadataSet,
            StoreOp::Unwatch,
        ]
    );

    // Directory entry, registration, and parent link all exist together.
    let child_id = h.store.get_id(POOL, "child").await.unwrap();
    assert_eq!(h.store.dir_list(POOL).await.unwrap()["child"], child_id);
    let spec = parent_spec(&parent_id);
    assert!(h
        .store
        .get_children(POOL, &spec)
        .await
        .unwrap()
        .contains(&child_id));
    let header = h.store.get_header(POOL, &child_id).await.unwrap();
    let link = header.parent.expect("child has a parent link");
    assert_eq!(link.spec, spec);
    assert_eq!(link.overlap, PARENT_SIZE);
    assert_eq!(header.features, Features::LAYERING);
    assert!(h.store.list_watchers(POOL, &child_id).await.unwrap().is_empty());

    let metadata = h.store.metadata_list(POOL, &child_id, "", 64).await.unwrap();
    assert_eq!(metadata.get("a").map(Vec::as_slice), Some(&b"1"[..]));
    h.cleanup_successful();
}

#[tokio::test]
async fn test_add_child_failure_rolls_back() {
    use CloneStep::*;
    let h = Harness::new("test_add_child_failure_rolls_back");
    let (parent_id, parent) =
        h.store_parent(Features::LAYERING, &[("a", "1")]).await;
    h.store.inject_error(
        StoreOp::AddChild,
        Error::PermissionDenied { message: "add_child".to_string() },
    );

    let (result, steps) =
        h.clone_from(parent, ImageOptions::default(), Default::default()).await;
    assert_matches!(result, Err(Error::PermissionDenied { .. }));
    assert_eq!(result_code(&result), -libc::EACCES);
    assert_eq!(
        steps,
        [
            ValidateParent,
            ValidateChild,
            CreateImage,
            OpenImage,
            SetParentInHeader,
            UpdateDirChildren,
            CloseImage,
            SwitchThreadContext,
            RemoveImage,
        ]
    );
    assert_eq!(h.store.call_count(StoreOp::RemoveHeader), 1);
    h.assert_no_child(&parent_spec(&parent_id)).await;
    h.cleanup_successful();
}

#[tokio::test]
async fn test_open_failure_removes_child_once() {
    let h = Harness::new("test_open_failure_removes_child_once");
    let (parent_id, parent) = h.store_parent(Features::LAYERING, &[]).await;
    h.store.inject_error(StoreOp::GetHeader, io("open"));

    let (result, steps) =
        h.clone_from(parent, ImageOptions::default(), Default::default()).await;
    assert_eq!(result, Err(io("open")));
    assert_eq!(
        &steps[2..],
        [CloneStep::CreateImage, CloneStep::OpenImage, CloneStep::RemoveImage]
    );
    assert_eq!(h.store.call_count(StoreOp::RemoveHeader), 1);
    assert_eq!(h.store.call_count(StoreOp::RemoveId), 1);
    h.assert_no_child(&parent_spec(&parent_id)).await;
    h.cleanup_successful();
}

#[tokio::test]
async fn test_metadata_list_failure_clears_registration() {
    use CloneStep::*;
    let h = Harness::new("test_metadata_list_failure_clears_registration");
    let parent = sim_parent(Features::LAYERING);
    parent.set_metadata("a", b"1");
    parent.inject_error(ImageOp::MetadataList, io("list"));
    let parent = Arc::new(parent);

    let (result, steps) = h
        .clone_from(parent.clone(), ImageOptions::default(), Default::default())
        .await;
    assert_eq!(result, Err(io("list")));
    assert_eq!(
        &steps[6..],
        [
            Refresh,
            GetMetasInParent,
            CleanDirChildren,
            CloseImage,
            SwitchThreadContext,
            RemoveImage,
        ]
    );
    h.assert_no_child(&parent_spec(&ImageId::new("simparent"))).await;
    h.cleanup_successful();
}

#[tokio::test]
async fn test_unwind_tolerates_missing_registration() {
    let h = Harness::new("test_unwind_tolerates_missing_registration");

    let mut results = Vec::new();
    for already_gone in [false, true] {
        let parent = sim_parent(Features::LAYERING);
        parent.inject_error(ImageOp::MetadataList, io("list"));
        if already_gone {
            h.store.inject_error(
                StoreOp::RemoveChild,
                Error::not_found(ResourceType::ChildRegistration, "child"),
            );
        }
        let (result, _) = h
            .clone_from(
                Arc::new(parent),
                ImageOptions::default(),
                Default::default(),
            )
            .await;
        results.push(result);
    }
    assert_eq!(results[0], Err(io("list")));
    assert_eq!(results[0], results[1]);
    h.assert_no_child(&parent_spec(&ImageId::new("simparent"))).await;
    h.cleanup_successful();
}

#[tokio::test]
async fn test_empty_metadata_skips_copy() {
    let h = Harness::new("test_empty_metadata_skips_copy");
    let parent = Arc::new(sim_parent(Features::LAYERING));

    let (result, steps) = h
        .clone_from(parent.clone(), ImageOptions::default(), Default::default())
        .await;
    assert_eq!(result, Ok(()));
    assert_eq!(
        &steps[6..],
        [
            CloneStep::Refresh,
            CloneStep::GetMetasInParent,
            CloneStep::CloseImage
        ]
    );
    assert_eq!(h.store.call_count(StoreOp::MetadataSet), 0);
    assert!(!parent.calls().contains(&ImageOp::MetadataSet));
    h.cleanup_successful();
}

#[tokio::test]
async fn test_metadata_copied_in_pages() {
    let h = Harness {
        config: CloneConfig { metadata_page_size: 2, ..Default::default() },
        ..Harness::new("test_metadata_copied_in_pages")
    };
    let pairs = [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")];
    let (_, parent) = h.store_parent(Features::LAYERING, &pairs).await;

    let (result, steps) =
        h.clone_from(parent, ImageOptions::default(), Default::default()).await;
    assert_eq!(result, Ok(()));
    let pages =
        steps.iter().filter(|s| **s == CloneStep::GetMetasInParent).count();
    assert_eq!(pages, 3);
    assert_eq!(h.store.call_count(StoreOp::MetadataSet), 1);

    let child_id = h.store.get_id(POOL, "child").await.unwrap();
    let copied = h.store.metadata_list(POOL, &child_id, "", 64).await.unwrap();
    assert_eq!(copied.len(), pairs.len());
    h.cleanup_successful();
}

#[tokio::test]
async fn test_metadata_unsupported_is_skipped() {
    let h = Harness::new("test_metadata_unsupported_is_skipped");
    let (_, parent) = h.store_parent(Features::LAYERING, &[("a", "1")]).await;
    h.store.set_metadata_unsupported(POOL, true);

    let (result, steps) =
        h.clone_from(parent, ImageOptions::default(), Default::default()).await;
    assert_eq!(result, Ok(()));
    assert!(!steps.contains(&CloneStep::SetMetasInChild));
    assert_eq!(h.store.call_count(StoreOp::MetadataSet), 0);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_remove_failure_requires_intervention() {
    let h = Harness::new("test_remove_failure_requires_intervention");
    let (_, parent) = h.store_parent(Features::LAYERING, &[]).await;
    let denied = Error::PermissionDenied { message: "add_child".to_string() };
    h.store.inject_error(StoreOp::AddChild, denied.clone());
    h.store.inject_error(StoreOp::RemoveHeader, io("remove_header"));

    let (result, _) =
        h.clone_from(parent, ImageOptions::default(), Default::default()).await;
    assert_eq!(result_code(&result), -libc::ENOTRECOVERABLE);
    assert_matches!(
        result,
        Err(Error::CleanupFailed { original, cleanup })
            if *original == denied && *cleanup == io("remove_header")
    );
    h.cleanup_successful();
}

#[tokio::test]
async fn test_concurrent_unprotect_is_detected() {
    use CloneStep::*;
    let h = Harness::new("test_concurrent_unprotect_is_detected");
    let (parent_id, parent) = h.store_parent(Features::LAYERING, &[]).await;
    // The parent handle's cached header still says protected.
    h.store.set_snap_protection(
        POOL,
        &parent_id,
        SNAP,
        ProtectionStatus::Unprotecting,
    );

    let (result, steps) =
        h.clone_from(parent, ImageOptions::default(), Default::default()).await;
    assert_matches!(result, Err(Error::InvalidRequest { .. }));
    assert_eq!(
        &steps[6..],
        [Refresh, CleanDirChildren, CloseImage, SwitchThreadContext, RemoveImage]
    );
    h.assert_no_child(&parent_spec(&parent_id)).await;
    h.cleanup_successful();
}

#[tokio::test]
async fn test_parent_validation() {
    let h = Harness::new("test_parent_validation");

    let at_head = SimImage::new(
        "head",
        POOL,
        sim_parent(Features::LAYERING).header().unwrap().clone(),
        None,
    );
    let no_layering = sim_parent(Features::STRIPINGV2);
    let unprotected = sim_parent(Features::LAYERING);
    let mut header = unprotected.header().unwrap().clone();
    header.snapshots.get_mut(&SNAP).unwrap().protection =
        ProtectionStatus::Unprotected;
    let unprotected = SimImage::new("unprotected", POOL, header, Some(SNAP));
    let old = sim_parent(Features::LAYERING).with_old_format();

    for (parent, errno) in [
        (at_head, -libc::EINVAL),
        (no_layering, -libc::ENOSYS),
        (unprotected, -libc::EINVAL),
        (old, -libc::EINVAL),
    ] {
        let name = parent.name().to_string();
        let (result, steps) = h
            .clone_from(
                Arc::new(parent),
                ImageOptions::default(),
                Default::default(),
            )
            .await;
        assert_eq!(result_code(&result), errno, "parent {name}: {result:?}");
        assert_eq!(steps, [CloneStep::ValidateParent]);
    }
    assert!(h.store.calls().is_empty());
    h.cleanup_successful();
}

#[tokio::test]
async fn test_name_taken() {
    let h = Harness::new("test_name_taken");
    let (_, parent) = h.store_parent(Features::LAYERING, &[]).await;
    let existing = h.store.seed_image(POOL, "child", Features::LAYERING, 1);

    let (result, steps) =
        h.clone_from(parent, ImageOptions::default(), Default::default()).await;
    assert_matches!(result, Err(Error::ObjectAlreadyExists { .. }));
    assert_eq!(steps, [CloneStep::ValidateParent, CloneStep::ValidateChild]);
    assert_eq!(h.store.get_id(POOL, "child").await.unwrap(), existing);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_mirrored_clone_of_non_primary_parent() {
    let h = Harness::new("test_mirrored_clone_of_non_primary_parent");
    let features =
        Features::LAYERING | Features::EXCLUSIVE_LOCK | Features::JOURNALING;
    let (parent_id, parent) = h.store_parent(features, &[]).await;
    h.store.set_tag_owner(POOL, &parent_id, false);

    let (result, _) = h
        .clone_from(parent.clone(), ImageOptions::default(), Default::default())
        .await;
    assert_matches!(result, Err(Error::InvalidRequest { .. }));

    let mirror = MirrorProvenance {
        non_primary_global_image_id: Some("global-id".to_string()),
        primary_mirror_uuid: Some("site-a".to_string()),
    };
    let (result, _) =
        h.clone_from(parent, ImageOptions::default(), mirror).await;
    assert_eq!(result, Ok(()));

    let child_id = h.store.get_id(POOL, "child").await.unwrap();
    let record = h.store.mirror_image_get(POOL, &child_id).await.unwrap();
    assert_eq!(record.global_image_id, "global-id");
    assert_eq!(record.primary_mirror_uuid.as_deref(), Some("site-a"));
    let header = h.store.get_header(POOL, &child_id).await.unwrap();
    assert_eq!(header.features, features);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_primary_check_follows_option_validation() {
    let h = Harness::new("test_primary_check_follows_option_validation");
    let features =
        Features::LAYERING | Features::EXCLUSIVE_LOCK | Features::JOURNALING;

    // Bad options are rejected before the parent's mirroring state is read.
    let parent = Arc::new(sim_parent(features));
    parent.set_primary(false);
    let opts = ImageOptions {
        features: Some((features | Features::DEEP_FLATTEN).bits()),
        ..Default::default()
    };
    let (result, steps) =
        h.clone_from(parent.clone(), opts, Default::default()).await;
    assert_matches!(result, Err(Error::InvalidValue { .. }));
    assert_eq!(steps, [CloneStep::ValidateParent, CloneStep::ValidateChild]);
    assert!(parent.calls().is_empty(), "calls: {:?}", parent.calls());

    let (result, steps) = h
        .clone_from(parent.clone(), ImageOptions::default(), Default::default())
        .await;
    assert_matches!(result, Err(Error::InvalidRequest { .. }));
    assert_eq!(steps, [CloneStep::ValidateParent, CloneStep::ValidateChild]);
    assert_eq!(parent.calls(), [ImageOp::IsPrimary]);
    assert!(h.store.calls().is_empty());
    h.cleanup_successful();
}

#[tokio::test]
async fn test_concurrent_clones_share_parent() {
    let h = Harness::new("test_concurrent_clones_share_parent");
    let (parent_id, parent) =
        h.store_parent(Features::LAYERING, &[("a", "1")]).await;

    let names = ["child-a", "child-b", "child-c"];
    let pending: Vec<_> = names
        .iter()
        .map(|name| {
            let history = StepHistory::new();
            let rx = h.send_clone(
                parent.clone(),
                name,
                ImageOptions::default(),
                Default::default(),
                &history,
            );
            (rx, history)
        })
        .collect();

    for (rx, history) in pending {
        assert_eq!(rx.await.unwrap(), Ok(()));
        assert_eq!(history.steps().last(), Some(&CloneStep::CloseImage));
    }

    let children =
        h.store.get_children(POOL, &parent_spec(&parent_id)).await.unwrap();
    assert_eq!(children.len(), names.len());
    let dir = h.store.dir_list(POOL).await.unwrap();
    for name in names {
        let id = dir.get(name).expect("child missing from directory");
        assert!(children.contains(id), "{name} is not registered");
    }
    h.cleanup_successful();
}

#[tokio::test]
async fn test_configured_default_options() {
    let h = Harness {
        config: CloneConfig {
            default_options: ImageOptions {
                order: Some(20),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Harness::new("test_configured_default_options")
    };
    let (_, parent) = h.store_parent(Features::LAYERING, &[]).await;

    let (result, _) =
        h.clone_from(parent, ImageOptions::default(), Default::default()).await;
    assert_eq!(result, Ok(()));
    let child_id = h.store.get_id(POOL, "child").await.unwrap();
    let header = h.store.get_header(POOL, &child_id).await.unwrap();
    assert_eq!(header.order, 20);
    assert_eq!(header.stripe_unit, 1 << 20);
    h.cleanup_successful();
}

// The #[proptest] macro doesn't work with #[tokio::test], so each case
// builds its own runtime.
#[proptest(ProptestConfig { cases: 32, ..ProptestConfig::default() })]
fn unsupported_feature_requests_issue_no_remote_calls(
    #[strategy(0u64..256)] bits: u64,
    #[strategy(prop::sample::select(vec![
        Features::STRIPINGV2,
        Features::DEEP_FLATTEN,
        Features::DATA_POOL,
    ]))]
    foreign: Features,
    #[strategy(prop::sample::select(vec![
        Features::LAYERING,
        Features::LAYERING | Features::EXCLUSIVE_LOCK | Features::JOURNALING,
    ]))]
    parent_features: Features,
) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (code, steps, calls) = runtime.block_on(async move {
        let h =
            Harness::new("unsupported_feature_requests_issue_no_remote_calls");
        let (parent_id, parent) = h.store_parent(parent_features, &[]).await;
        // Only the mirroring primary may be cloned without provenance.
        h.store.set_tag_owner(POOL, &parent_id, false);
        h.store.clear_calls();

        let opts = ImageOptions {
            features: Some(bits | foreign.bits()),
            ..Default::default()
        };
        let (result, steps) =
            h.clone_from(parent, opts, Default::default()).await;
        let calls = h.store.calls();
        h.cleanup_successful();
        (result_code(&result), steps, calls)
    });

    prop_assert!(
        code == -libc::EINVAL || code == -libc::ENOSYS,
        "unexpected result code {code}"
    );
    prop_assert_eq!(
        steps,
        vec![CloneStep::ValidateParent, CloneStep::ValidateChild]
    );
    prop_assert!(calls.is_empty(), "remote calls issued: {calls:?}");
}
