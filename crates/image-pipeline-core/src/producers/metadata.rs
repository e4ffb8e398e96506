//! Metadata add/remove stages around the encoded payload

use crate::consumer::{DelegatingConsumer, SharedConsumer};
use crate::context::RequestContext;
use crate::image_data::{EncodedImage, ImageMetaData};
use crate::producer::{Producer, SharedProducer};
use crate::reference::CloseableRef;
use std::sync::Arc;

/// Parses format and dimensions into results that lack them
pub struct AddMetaDataProducer {
    input: SharedProducer<EncodedImage>,
}

impl AddMetaDataProducer {
    pub const NAME: &'static str = "AddMetaDataProducer";

    pub fn new(input: SharedProducer<EncodedImage>) -> Self {
        Self { input }
    }
}

impl Producer<EncodedImage> for AddMetaDataProducer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<EncodedImage>, context: Arc<RequestContext>) {
        let wrapped = DelegatingConsumer::map(consumer, Self::NAME, |encoded: EncodedImage| {
            if encoded.metadata().is_some() {
                return Ok(encoded);
            }
            let metadata = ImageMetaData::parse(encoded.bytes()?);
            Ok(encoded.with_metadata(metadata))
        });
        self.input.produce_results(wrapped.shared(), context);
    }
}

/// Strips metadata and forwards the raw byte handle
pub struct RemoveMetaDataProducer {
    input: SharedProducer<EncodedImage>,
}

impl RemoveMetaDataProducer {
    pub const NAME: &'static str = "RemoveMetaDataProducer";

    pub fn new(input: SharedProducer<EncodedImage>) -> Self {
        Self { input }
    }
}

impl Producer<CloseableRef<Vec<u8>>> for RemoveMetaDataProducer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(
        &self,
        consumer: SharedConsumer<CloseableRef<Vec<u8>>>,
        context: Arc<RequestContext>,
    ) {
        let wrapped = DelegatingConsumer::new(
            consumer,
            Self::NAME,
            |downstream, result: Option<EncodedImage>, status| {
                let bytes = result
                    .filter(EncodedImage::is_valid)
                    .map(EncodedImage::into_bytes_ref);
                downstream.on_new_result(bytes, status);
                Ok(())
            },
        );
        self.input.produce_results(wrapped.shared(), context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::test_support::{Event, RecordingConsumer};
    use crate::consumer::ResultStatus;
    use crate::image_data::test_support::png_bytes;
    use crate::image_data::ImageFormat;
    use crate::producers::test_support::{recorded_context, ScriptedProducer};
    use crate::request::ImageRequest;

    #[test]
    fn test_add_parses_missing_metadata() {
        let upstream = ScriptedProducer::new(vec![(
            Some(EncodedImage::from_vec(png_bytes(7, 4))),
            ResultStatus::IS_LAST,
        )]);
        let producer = AddMetaDataProducer::new(upstream);
        let consumer = RecordingConsumer::new();
        let (context, _) = recorded_context(ImageRequest::from_uri("mem://a").unwrap());

        producer.produce_results(consumer.clone(), context);

        let encoded = consumer.last_result().unwrap();
        let metadata = encoded.metadata().unwrap();
        assert_eq!(metadata.format, ImageFormat::Png);
        assert_eq!((metadata.width, metadata.height), (Some(7), Some(4)));
        assert_eq!(encoded.bytes().unwrap(), png_bytes(7, 4).as_slice());
    }

    #[test]
    fn test_remove_forwards_bytes_and_none() {
        let upstream = ScriptedProducer::new(vec![
            (Some(EncodedImage::from_vec(vec![1, 2, 3])), ResultStatus::empty()),
            (None, ResultStatus::IS_LAST),
        ]);
        let producer = RemoveMetaDataProducer::new(upstream);
        let consumer = RecordingConsumer::new();
        let (context, _) = recorded_context(ImageRequest::from_uri("mem://a").unwrap());

        producer.produce_results(consumer.clone(), context);

        let events = consumer.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            Event::Result(Some(bytes), status) => {
                assert_eq!(bytes.get().unwrap(), &vec![1, 2, 3]);
                assert!(status.is_not_last());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(events[1], Event::Result(None, status) if status.is_last()));
    }
}
