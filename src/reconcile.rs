use crate::annotations::AnnotationRow;
use crate::master::MasterRow;
use std::collections::HashMap;

/// Merge previously saved annotations back onto the current master rows.
///
/// Every master row appears in the output. The annotation column is populated
/// from the prior file wherever the natural key (store_code, product_code)
/// matches, and left empty otherwise; every other master attribute (quantity,
/// amount, description) always wins over whatever stale copy the prior file
/// carried. When the prior file has duplicate keys the last row wins, matching
/// overwrite-on-save semantics.
///
/// A prior file whose keys no longer line up with the master (key column type
/// drift, renamed codes) simply produces no matches; that is "no prior
/// annotation", not an error.
pub fn reconcile(master: &[MasterRow], prior: Option<&[AnnotationRow]>) -> Vec<MasterRow> {
    let mut saved: HashMap<(String, String), String> = HashMap::new();
    if let Some(prior) = prior {
        for row in prior {
            saved.insert(join_key(&row.store_code, &row.product_code), row.annotation.clone());
        }
    }

    master
        .iter()
        .map(|row| {
            let mut out = row.clone();
            out.annotation = saved
                .get(&join_key(&row.store_code, &row.product_code))
                .cloned()
                .unwrap_or_default();
            out
        })
        .collect()
}

// Join keys are compared as trimmed strings so "T001 " and "T001" match.
fn join_key(store_code: &str, product_code: &str) -> (String, String) {
    (
        store_code.trim().to_string(),
        product_code.trim().to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::to_annotations;

    fn master_row(store: &str, product: &str, qty: f64) -> MasterRow {
        MasterRow {
            store_code: store.to_string(),
            store_name: format!("Toko {}", store),
            area_manager: "AM1".to_string(),
            area_supervisor: "AS1".to_string(),
            product_code: product.to_string(),
            description: format!("Produk {}", product),
            quantity: qty,
            amount: qty * 1000.0,
            annotation: String::new(),
        }
    }

    fn prior_row(store: &str, product: &str, note: &str) -> AnnotationRow {
        AnnotationRow {
            store_code: store.to_string(),
            product_code: product.to_string(),
            annotation: note.to_string(),
        }
    }

    #[test]
    fn annotations_land_exactly_on_matching_keys() {
        let master = vec![
            master_row("T001", "P1", 1.0),
            master_row("T001", "P2", 2.0),
            master_row("T001", "P3", 3.0),
        ];
        let prior = vec![prior_row("T001", "P1", "sudah dikirim"), prior_row("T001", "P3", "selisih")];

        let merged = reconcile(&master, Some(&prior));
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].annotation, "sudah dikirim");
        assert_eq!(merged[1].annotation, "");
        assert_eq!(merged[2].annotation, "selisih");
    }

    #[test]
    fn master_attributes_win_over_the_prior_file() {
        // The prior file only contributes annotations; a changed quantity on
        // the master must survive reconciliation untouched.
        let master = vec![master_row("T001", "P1", 99.0)];
        let prior = vec![prior_row("T001", "P1", "cek ulang")];

        let merged = reconcile(&master, Some(&prior));
        assert_eq!(merged[0].quantity, 99.0);
        assert_eq!(merged[0].annotation, "cek ulang");
    }

    #[test]
    fn no_prior_file_yields_empty_annotations() {
        let mut master = vec![master_row("T001", "P1", 1.0)];
        master[0].annotation = "stale text from the master itself".to_string();

        let merged = reconcile(&master, None);
        assert_eq!(merged[0].annotation, "");
    }

    #[test]
    fn duplicate_prior_keys_keep_the_last_write() {
        let master = vec![master_row("T001", "P1", 1.0)];
        let prior = vec![
            prior_row("T001", "P1", "first"),
            prior_row("T001", "P1", "second"),
        ];

        let merged = reconcile(&master, Some(&prior));
        assert_eq!(merged[0].annotation, "second");
    }

    #[test]
    fn keys_match_after_trimming() {
        let master = vec![master_row("T001", "P1", 1.0)];
        let prior = vec![prior_row(" T001 ", "P1 ", "ok")];

        let merged = reconcile(&master, Some(&prior));
        assert_eq!(merged[0].annotation, "ok");
    }

    #[test]
    fn drifted_keys_mean_no_prior_annotation() {
        let master = vec![master_row("T001", "20114321", 1.0)];
        // Prior file was saved when the product key column was formatted
        // differently; nothing matches and nothing blows up.
        let prior = vec![prior_row("T001", "20114321.0", "lama")];

        let merged = reconcile(&master, Some(&prior));
        assert_eq!(merged[0].annotation, "");
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let master = vec![
            master_row("T001", "P1", 1.0),
            master_row("T001", "P2", 2.0),
        ];
        let prior = vec![prior_row("T001", "P2", "catatan")];

        let once = reconcile(&master, Some(&prior));
        let again = reconcile(&once, Some(&to_annotations(&once)));
        assert_eq!(once, again);
    }
}
