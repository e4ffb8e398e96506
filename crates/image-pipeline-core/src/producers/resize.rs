//! Resize and rotation of decoded bitmaps

use crate::consumer::{DelegatingConsumer, ResultStatus, SharedConsumer};
use crate::context::RequestContext;
use crate::error::Result;
use crate::image_data::{BitmapRef, DecodedImage};
use crate::producer::{Producer, SharedProducer};
use crate::producers::stage_extras;
use crate::reference::CloseableRef;
use crate::request::{ResizeOptions, RotationOptions};
use image::imageops::{self, FilterType};
use std::sync::Arc;

pub const EXTRA_ORIGINAL_SIZE: &str = "original_size";
pub const EXTRA_REQUESTED_SIZE: &str = "requested_size";
pub const EXTRA_ROTATION: &str = "rotation";

/// Size that fits `(width, height)` inside `resize`, preserving aspect
/// ratio. Never upscales.
pub fn fit_within(width: u32, height: u32, resize: ResizeOptions) -> (u32, u32) {
    if width <= resize.width && height <= resize.height {
        return (width, height);
    }
    let scale = f64::min(
        f64::from(resize.width) / f64::from(width),
        f64::from(resize.height) / f64::from(height),
    );
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

fn transform(
    source: &DecodedImage,
    resize: Option<ResizeOptions>,
    rotation: RotationOptions,
) -> DecodedImage {
    let (width, height) = match resize {
        Some(resize) => fit_within(source.width(), source.height(), resize),
        None => (source.width(), source.height()),
    };
    let mut bitmap = if (width, height) != (source.width(), source.height()) {
        imageops::resize(source.bitmap(), width, height, FilterType::Triangle)
    } else {
        source.bitmap().clone()
    };
    bitmap = match rotation.degrees() {
        90 => imageops::rotate90(&bitmap),
        180 => imageops::rotate180(&bitmap),
        270 => imageops::rotate270(&bitmap),
        _ => bitmap,
    };
    source.clone().with_bitmap(bitmap)
}

/// Fits bitmaps into the request's `ResizeOptions` and applies its rotation
pub struct ResizeAndRotateProducer {
    input: SharedProducer<BitmapRef>,
}

impl ResizeAndRotateProducer {
    pub const NAME: &'static str = "ResizeAndRotateProducer";

    pub fn new(input: SharedProducer<BitmapRef>) -> Self {
        Self { input }
    }
}

impl Producer<BitmapRef> for ResizeAndRotateProducer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<BitmapRef>, context: Arc<RequestContext>) {
        context.listener().on_producer_start(&context, Self::NAME);
        let request = context.image_request();
        let resize = request.resize_options();
        let rotation = request.rotation_options();
        let handler_context = Arc::clone(&context);

        let wrapped = DelegatingConsumer::new(
            consumer,
            Self::NAME,
            move |downstream, result: Option<BitmapRef>, status: ResultStatus| -> Result<()> {
                let context = handler_context.as_ref();
                let Some(source) = result else {
                    if status.is_last() {
                        context
                            .listener()
                            .on_producer_finish_with_success(context, Self::NAME, None);
                    }
                    downstream.on_new_result(None, status);
                    return Ok(());
                };

                let transformed = if status.contains(ResultStatus::IS_RESIZING_DONE) {
                    source
                } else {
                    let image = match source.get() {
                        Ok(image) => image,
                        Err(error) => {
                            context.listener().on_producer_finish_with_failure(
                                context,
                                Self::NAME,
                                &error,
                                None,
                            );
                            return Err(error);
                        }
                    };
                    let unchanged = !rotation.rotation_enabled()
                        && resize.map_or(true, |r| {
                            fit_within(image.width(), image.height(), r)
                                == (image.width(), image.height())
                        });
                    if status.is_last() {
                        let extras = stage_extras(
                            context,
                            Self::NAME,
                            &[
                                (
                                    EXTRA_ORIGINAL_SIZE,
                                    format!("{}x{}", image.width(), image.height()),
                                ),
                                (
                                    EXTRA_REQUESTED_SIZE,
                                    resize.map_or_else(
                                        || "unspecified".to_string(),
                                        |r| format!("{}x{}", r.width, r.height),
                                    ),
                                ),
                                (EXTRA_ROTATION, rotation.degrees().to_string()),
                            ],
                        );
                        context.listener().on_producer_finish_with_success(
                            context,
                            Self::NAME,
                            extras.as_ref(),
                        );
                    }
                    if unchanged {
                        source
                    } else {
                        CloseableRef::of(transform(image, resize, rotation))
                    }
                };

                downstream.on_new_result(Some(transformed), status | ResultStatus::IS_RESIZING_DONE);
                Ok(())
            },
        );
        self.input.produce_results(wrapped.shared(), context);
    }
}
