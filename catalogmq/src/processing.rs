use crate::model::{Category, Product};
use catalogmq_client::{processor_fn, Processor};
use log::info;
use std::sync::Arc;

pub(crate) fn product_processor() -> Arc<dyn Processor<Product>> {
    processor_fn(|product: Product| {
        info!("Processing product message: {}", product.name);

        Ok(())
    })
}

pub(crate) fn category_processor() -> Arc<dyn Processor<Category>> {
    processor_fn(|category: Category| {
        info!("Processing category message: {}", category.name);

        Ok(())
    })
}
