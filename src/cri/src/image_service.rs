//! CRI ImageService implementation.
//!
//! Maps CRI image operations onto the manager's image store through the
//! runtime image layer, which owns pull retries and coalescing.

use tonic::{Request, Response, Status};

use podlx_runtime::image::{ImageRecord, ImageRef, ImageService};

use crate::cri_api::image_service_server::ImageService as CriImageService;
use crate::cri_api::*;
use crate::error::shim_error_to_status;

/// podlx implementation of the CRI ImageService.
pub struct PodlxImageService {
    images: ImageService,
    /// Mountpoint reported for the image filesystem.
    image_fs_path: String,
}

impl PodlxImageService {
    pub fn new(images: ImageService, image_fs_path: String) -> Self {
        Self {
            images,
            image_fs_path,
        }
    }

    fn to_cri_image(record: ImageRecord) -> Image {
        let digest = record.digest();
        let repo_digests = record
            .tags
            .first()
            .map(|tag| vec![format!("{}@{}", tag, digest)])
            .unwrap_or_default();
        Image {
            id: digest,
            repo_tags: record.tags.clone(),
            repo_digests,
            size: record.size_bytes,
            uid: None,
            username: String::new(),
            spec: record.tags.first().map(|tag| ImageSpec {
                image: tag.clone(),
                annotations: Default::default(),
            }),
        }
    }
}

#[tonic::async_trait]
impl CriImageService for PodlxImageService {
    async fn list_images(
        &self,
        _request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        let records = self.images.list().await.map_err(shim_error_to_status)?;
        let images = records.into_iter().map(Self::to_cri_image).collect();
        Ok(Response::new(ListImagesResponse { images }))
    }

    async fn image_status(
        &self,
        request: Request<ImageStatusRequest>,
    ) -> Result<Response<ImageStatusResponse>, Status> {
        let req = request.into_inner();
        let spec = req
            .image
            .ok_or_else(|| Status::invalid_argument("image spec required"))?;

        let reference = ImageRef::parse(&spec.image).map_err(shim_error_to_status)?;
        let image = self
            .images
            .lookup(&reference)
            .await
            .map_err(shim_error_to_status)?
            .map(Self::to_cri_image);

        Ok(Response::new(ImageStatusResponse {
            image,
            info: Default::default(),
        }))
    }

    async fn pull_image(
        &self,
        request: Request<PullImageRequest>,
    ) -> Result<Response<PullImageResponse>, Status> {
        let req = request.into_inner();
        let spec = req
            .image
            .ok_or_else(|| Status::invalid_argument("image spec required"))?;

        tracing::info!(image = %spec.image, "CRI PullImage");

        let record = self
            .images
            .pull(&spec.image)
            .await
            .map_err(shim_error_to_status)?;

        Ok(Response::new(PullImageResponse {
            image_ref: record.digest(),
        }))
    }

    async fn remove_image(
        &self,
        request: Request<RemoveImageRequest>,
    ) -> Result<Response<RemoveImageResponse>, Status> {
        let req = request.into_inner();
        let spec = req
            .image
            .ok_or_else(|| Status::invalid_argument("image spec required"))?;

        tracing::info!(image = %spec.image, "CRI RemoveImage");

        self.images
            .remove(&spec.image)
            .await
            .map_err(shim_error_to_status)?;

        Ok(Response::new(RemoveImageResponse {}))
    }

    async fn image_fs_info(
        &self,
        _request: Request<ImageFsInfoRequest>,
    ) -> Result<Response<ImageFsInfoResponse>, Status> {
        let total = self
            .images
            .total_size()
            .await
            .map_err(shim_error_to_status)?;

        let usage = FilesystemUsage {
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
            fs_id: Some(FilesystemIdentifier {
                mountpoint: self.image_fs_path.clone(),
            }),
            used_bytes: Some(UInt64Value { value: total }),
            inodes_used: None,
        };

        Ok(Response::new(ImageFsInfoResponse {
            image_filesystems: vec![usage],
        }))
    }
}
