use catalogd::cache::key::{encode, NULL_TOKEN};
use catalogd::cache::QueryKeyCodec;
use catalogd::query::{PRODUCTS_NAMESPACE, PRODUCT_FILTERS};
use catalogd::types::{FilterValue, PageRequest};
use std::collections::HashSet;

fn codec() -> QueryKeyCodec {
  QueryKeyCodec::new(PRODUCTS_NAMESPACE).with_fields(PRODUCT_FILTERS.iter().copied())
}

#[test]
fn test_key_ignores_filter_insertion_order() {
  let a = PageRequest::new(1, 10)
    .unwrap()
    .filter("product_name", "phone")
    .unwrap()
    .filter("category", "A")
    .unwrap()
    .filter("min_price", 10.0)
    .unwrap();
  let b = PageRequest::new(1, 10)
    .unwrap()
    .filter("min_price", 10.0)
    .unwrap()
    .filter("category", "A")
    .unwrap()
    .filter("product_name", "phone")
    .unwrap();

  assert_eq!(codec().encode(&a), codec().encode(&b));
  assert_eq!(encode("misc", &a), encode("misc", &b));
}

#[test]
fn test_distinct_filter_combinations_get_distinct_keys() {
  let names = [None, Some("phone"), Some("")];
  let categories = [None, Some("A"), Some("B")];
  let prices = [None, Some(10.0), Some(10.5)];

  let mut keys = HashSet::new();
  let mut requests = 0;
  for name in names {
    for category in categories {
      for price in prices {
        let request = PageRequest::new(1, 10)
          .unwrap()
          .filter_opt("product_name", name)
          .unwrap()
          .filter_opt("category", category)
          .unwrap()
          .filter_opt("min_price", price)
          .unwrap();
        keys.insert(codec().encode(&request));
        requests += 1;
      }
    }
  }

  // An empty name is the same query as no name.
  assert_eq!(requests, 27);
  assert_eq!(keys.len(), 18);
}

#[test]
fn test_paging_is_part_of_the_key() {
  let first = PageRequest::new(1, 10).unwrap();
  let second = PageRequest::new(2, 10).unwrap();
  let wider = PageRequest::new(1, 20).unwrap();

  let keys: HashSet<String> = [first, second, wider].iter().map(|r| codec().encode(r)).collect();
  assert_eq!(keys.len(), 3);
}

#[test]
fn test_value_types_do_not_collide() {
  let text = PageRequest::new(1, 10).unwrap().filter("stock", "5").unwrap();
  let int = PageRequest::new(1, 10).unwrap().filter("stock", 5i64).unwrap();
  let num = PageRequest::new(1, 10).unwrap().filter("stock", 5.5).unwrap();
  let dash = PageRequest::new(1, 10).unwrap().filter("stock", NULL_TOKEN).unwrap();

  let keys: HashSet<String> = [&text, &int, &num, &dash]
    .iter()
    .map(|r| encode("products", r))
    .collect();
  assert_eq!(keys.len(), 4);
}

#[test]
fn test_requests_selecting_the_same_rows_share_a_key() {
  let plain = PageRequest::new(1, 10)
    .unwrap()
    .filter("category", "A")
    .unwrap()
    .filter("min_price", 10i64)
    .unwrap();
  let loose = PageRequest::new(1, 10)
    .unwrap()
    .filter("category", " A ")
    .unwrap()
    .filter("min_price", 10.0)
    .unwrap();

  assert_eq!(codec().encode(&plain), codec().encode(&loose));
  assert!(codec().encode(&plain).contains(":min_price=i10:"));
}

#[test]
fn test_range_filters() {
  let open = PageRequest::new(1, 10)
    .unwrap()
    .filter("price", FilterValue::Range { min: None, max: None })
    .unwrap();
  let bounded = PageRequest::new(1, 10)
    .unwrap()
    .filter(
      "price",
      FilterValue::Range {
        min: Some(1.0),
        max: None,
      },
    )
    .unwrap();

  assert_eq!(encode("products", &open), "products:page=1:size=10");
  assert_eq!(encode("products", &bounded), "products:page=1:size=10:price=r1~_");
}

#[test]
fn test_every_key_starts_with_its_namespace_prefix() {
  let request = PageRequest::new(3, 5)
    .unwrap()
    .filter("category", "products:evil")
    .unwrap();
  let key = codec().encode(&request);
  assert!(key.starts_with(&codec().prefix()));
  assert!(!codec()
    .renamed("products2")
    .encode(&request)
    .starts_with(&codec().prefix()));
}
