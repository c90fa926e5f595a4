use crate::master::MasterRow;
use std::error::Error;

// Column order is fixed to the source layout with the annotation appended,
// and the headers are spellings the master parser recognizes, so an exported
// file can be re-ingested as a result file.
const EXPORT_HEADERS: &[&str] = &[
    "KODE TOKO",
    "NAMA TOKO",
    "AM",
    "AS",
    "PRDCD",
    "DESKRIPSI",
    "QTY",
    "RUPIAH",
    "KETERANGAN",
];

/// Convert working rows to CSV.
///
/// Values containing commas, quotes, or newlines are quoted with doubled
/// inner quotes.
pub fn to_csv(rows: &[MasterRow]) -> String {
    let mut csv_content = String::new();

    for (i, header) in EXPORT_HEADERS.iter().enumerate() {
        if i > 0 {
            csv_content.push(',');
        }
        csv_content.push_str(header);
    }
    csv_content.push('\n');

    for row in rows {
        let fields = [
            row.store_code.clone(),
            row.store_name.clone(),
            row.area_manager.clone(),
            row.area_supervisor.clone(),
            row.product_code.clone(),
            row.description.clone(),
            format_number(row.quantity),
            format_number(row.amount),
            row.annotation.clone(),
        ];
        for (i, value) in fields.iter().enumerate() {
            if i > 0 {
                csv_content.push(',');
            }
            if value.contains(',') || value.contains('"') || value.contains('\n') {
                let escaped = value.replace('"', "\"\"");
                csv_content.push_str(&format!("\"{}\"", escaped));
            } else {
                csv_content.push_str(value);
            }
        }
        csv_content.push('\n');
    }

    csv_content
}

/// Convert working rows to an XLSX workbook in memory.
pub fn to_xlsx(rows: &[MasterRow]) -> Result<Vec<u8>, Box<dyn Error>> {
    use rust_xlsxwriter::{Workbook, Worksheet};

    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();

    for (col, header) in EXPORT_HEADERS.iter().enumerate() {
        worksheet.write_string(0, col as u16, *header)?;
    }

    for (i, row) in rows.iter().enumerate() {
        let r = (i + 1) as u32;
        worksheet.write_string(r, 0, &row.store_code)?;
        worksheet.write_string(r, 1, &row.store_name)?;
        worksheet.write_string(r, 2, &row.area_manager)?;
        worksheet.write_string(r, 3, &row.area_supervisor)?;
        worksheet.write_string(r, 4, &row.product_code)?;
        worksheet.write_string(r, 5, &row.description)?;
        worksheet.write_number(r, 6, row.quantity)?;
        worksheet.write_number(r, 7, row.amount)?;
        worksheet.write_string(r, 8, &row.annotation)?;
    }

    workbook.push_worksheet(worksheet);
    let buffer = workbook.save_to_buffer()?;

    Ok(buffer)
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(product: &str, note: &str) -> MasterRow {
        MasterRow {
            store_code: "T001".to_string(),
            store_name: "Toko, Satu".to_string(),
            area_manager: "AM1".to_string(),
            area_supervisor: "AS1".to_string(),
            product_code: product.to_string(),
            description: "Produk \"istimewa\"".to_string(),
            quantity: -262200.0,
            amount: 1234.5,
            annotation: note.to_string(),
        }
    }

    #[test]
    fn csv_escapes_commas_and_quotes() {
        let csv = to_csv(&[row("P1", "baris\nkedua")]);
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap(), EXPORT_HEADERS.join(","));

        let body = &csv[csv.find('\n').unwrap() + 1..];
        assert!(body.contains("\"Toko, Satu\""));
        assert!(body.contains("\"Produk \"\"istimewa\"\"\""));
        assert!(body.contains("\"baris\nkedua\""));
        assert!(body.contains("-262200"));
    }

    #[test]
    fn xlsx_round_trips_through_the_master_parser() {
        let bytes = to_xlsx(&[row("P1", "catatan")]).unwrap();
        let parsed = crate::master::parse_master(&bytes).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].store_code, "T001");
        assert_eq!(parsed[0].product_code, "P1");
        assert_eq!(parsed[0].quantity, -262200.0);
        assert_eq!(parsed[0].annotation, "catatan");
    }
}
