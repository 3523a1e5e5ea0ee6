// badge-sheets: Print participant badges onto adhesive label sheets

use clap::Parser;
use ::image::{DynamicImage, Luma};
use printpdf::*;
use qrcode::QrCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn, Level};

// ============================================================================
// Constants
// ============================================================================

/// A4 dimensions in mm
const A4_WIDTH_MM: f32 = 210.0;
const A4_HEIGHT_MM: f32 = 297.0;

const PT_TO_MM: f32 = 25.4 / 72.0;

const DEFAULT_LAYOUT: &str = "1212";

/// Padding removed from every cell before drawing (split between both sides)
const CELL_PADDING_MM: f32 = 3.0;

/// Quiet border drawn inside the QR square
const QR_BORDER_MM: f32 = 1.0;

/// Vertical structure of a badge, as fractions of the padded cell height
const QR_SIZE_RATIO: f32 = 0.35;
const TYPE_BASELINE_RATIO: f32 = 0.075;
const TYPE_HEIGHT_RATIO: f32 = 0.15;
const DIVIDER_RATIO: f32 = 0.25;
const NAME_TOP_RATIO: f32 = 0.35;
const STACKED_NAME_TOP_RATIO: f32 = 0.20;
const LINE_HEIGHT_RATIO: f32 = 0.20;
const LINE_GAP_RATIO: f32 = 0.08;
const DIVIDER_LENGTH_RATIO: f32 = 0.95;

/// Starting font sizes in points
const TYPE_FONT_SIZE: f32 = 16.0;
const NAME_FONT_SIZE: f32 = 22.0;
const DETAIL_FONT_SIZE: f32 = 16.0;

/// Below this size the full name is split over two lines
const NAME_MIN_SINGLE_LINE_PT: f32 = 16.0;

const FIT_STEP_PT: f32 = 0.5;
const FIT_FLOOR_PT: f32 = 0.5;

/// Input header contract
const COL_KIND: &str = "Type of Participant";
const COL_EMAIL: &str = "Email";
const COL_LAST_NAME: &str = "Last Name";
const COL_FIRST_NAME: &str = "First Name";
const COL_ROLE: &str = "Job Title";
const COL_COMPANY: &str = "Organisation";

const REQUIRED_COLUMNS: [&str; 6] = [
    COL_KIND,
    COL_EMAIL,
    COL_LAST_NAME,
    COL_FIRST_NAME,
    COL_ROLE,
    COL_COMPANY,
];

/// Standard AFM advance widths for ' '..='~'
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, // '0'..'9'
    278, 278, 584, 584, 584, 556, 1015, // ':'..'@'
    667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, // 'A'..'M'
    722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, // 'N'..'Z'
    278, 278, 278, 469, 556, 333, // '['..'`'
    556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, // 'a'..'m'
    556, 556, 556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, // 'n'..'z'
    334, 260, 334, 584, // '{'..'~'
];

const HELVETICA_BOLD_WIDTHS: [u16; 95] = [
    278, 333, 474, 556, 556, 889, 722, 238, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, // '0'..'9'
    333, 333, 584, 584, 584, 611, 975, // ':'..'@'
    722, 722, 722, 722, 667, 611, 778, 722, 278, 556, 722, 611, 833, // 'A'..'M'
    722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, // 'N'..'Z'
    333, 278, 333, 584, 556, 333, // '['..'`'
    556, 611, 556, 611, 556, 333, 611, 611, 278, 278, 556, 278, 889, // 'a'..'m'
    611, 611, 611, 611, 389, 556, 333, 611, 556, 778, 556, 556, 500, // 'n'..'z'
    389, 280, 389, 584, // '{'..'~'
];

const HELVETICA_ASCENT: f32 = 718.0;
const HELVETICA_DESCENT: f32 = -207.0;
const HELVETICA_DEFAULT_ADVANCE: f32 = 556.0;

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unknown layout '{0}' (use --layout-list to see supported layouts)")]
    UnknownLayout(String),
    #[error("Missing {0}")]
    MissingArgument(&'static str),
    #[error("Input file not found: {0}")]
    InputNotFound(String),
    #[error("Input file has no '{0}' column")]
    MissingColumn(&'static str),
    #[error("Failed to read input file: {0}")]
    CsvError(String),
    #[error("Failed to load font: {0}")]
    FontError(String),
    #[error("Failed to generate QR code: {0}")]
    QrError(String),
    #[error("Failed to create PDF: {0}")]
    PdfError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

// ============================================================================
// Data Structures
// ============================================================================

/// CLI Arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Generate printable badge sheets from a participant list")]
struct Args {
    /// Participant list (CSV with a header row)
    #[arg(value_name = "INPUT.CSV", required_unless_present = "layout_list")]
    input: Option<PathBuf>,

    /// Output PDF file
    #[arg(value_name = "OUTPUT.PDF", required_unless_present = "layout_list")]
    output: Option<PathBuf>,

    /// Label sheet layout (see --layout-list)
    #[arg(long, default_value = DEFAULT_LAYOUT)]
    layout: String,

    /// Display supported layouts and exit
    #[arg(long)]
    layout_list: bool,

    /// Print with layout debugging marks
    #[arg(long)]
    debug: bool,

    /// Sticker slot to start from on the first sheet
    #[arg(long, default_value = "0")]
    start: usize,

    /// First CSV entry to process (zero-based, inclusive)
    #[arg(long)]
    csvfirst: Option<usize>,

    /// Last CSV entry to process (zero-based, inclusive)
    #[arg(long)]
    csvlast: Option<usize>,

    /// CSV field delimiter
    #[arg(long, default_value = ",")]
    delimiter: char,

    /// TrueType font for regular text (defaults to built-in Helvetica)
    #[arg(long, value_name = "TTF")]
    font: Option<PathBuf>,

    /// TrueType font for names (defaults to built-in Helvetica Bold)
    #[arg(long, value_name = "TTF")]
    bold_font: Option<PathBuf>,

    /// Log every badge as it is drawn
    #[arg(short, long)]
    verbose: bool,
}

/// Physical label sheet geometry, all lengths in mm
#[derive(Debug, Clone, Copy, PartialEq)]
struct SheetLayout {
    key: &'static str,
    description: &'static str,
    page_width: f32,
    page_height: f32,
    cell_width: f32,
    cell_height: f32,
    rows: usize,
    cols: usize,
    gap_x: f32,
    gap_y: f32,
    margin_x: f32,
    margin_y: f32,
}

impl SheetLayout {
    fn per_page(&self) -> usize {
        self.rows * self.cols
    }
}

/// One badge worth of participant data
#[derive(Debug, Clone, PartialEq)]
struct Entry {
    kind: String,
    email: String,
    last_name: String,
    first_name: String,
    role: String,
    company: String,
    /// Zero-based index among the non-empty rows of the input
    position: usize,
}

/// Raw CSV record, keyed by the input header contract
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CsvRow {
    #[serde(rename = "Type of Participant")]
    kind: String,
    #[serde(rename = "Email")]
    email: String,
    #[serde(rename = "Last Name")]
    last_name: String,
    #[serde(rename = "First Name")]
    first_name: String,
    #[serde(rename = "Job Title")]
    role: String,
    #[serde(rename = "Organisation")]
    company: String,
}

/// Inclusive bounds on entry positions
#[derive(Debug, Clone, Copy, Default)]
struct RowRange {
    first: Option<usize>,
    last: Option<usize>,
}

/// Badge generation configuration
struct BadgeConfig {
    layout: &'static SheetLayout,
    start: usize,
    range: RowRange,
    delimiter: u8,
    debug: bool,
}

/// Cell rectangle in PDF coordinates (mm, origin bottom-left)
#[derive(Debug, Clone, Copy, PartialEq)]
struct CellRect {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

impl CellRect {
    fn inset(&self, by: f32) -> Self {
        Self {
            x: self.x + by,
            y: self.y + by,
            width: self.width - 2.0 * by,
            height: self.height - 2.0 * by,
        }
    }

    fn top(&self) -> f32 {
        self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Placement {
    page: usize,
    row: usize,
    col: usize,
    rect: CellRect,
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), AppError> {
    let args = Args::parse();

    if args.layout_list {
        print_layouts();
        return Ok(());
    }

    init_logging(args.verbose);

    let (input, output) = badge_paths(&args)?;

    let delimiter = u8::try_from(args.delimiter)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| AppError::CsvError(format!("delimiter '{}' is not ASCII", args.delimiter)))?;

    let config = BadgeConfig {
        layout: find_layout(&args.layout)?,
        start: args.start,
        range: RowRange {
            first: args.csvfirst,
            last: args.csvlast,
        },
        delimiter,
        debug: args.debug,
    };

    let fonts = FontRegistry::load(args.font.as_deref(), args.bold_font.as_deref())?;

    let entries = load_entries(&input, config.range, config.delimiter)?;
    info!("Loaded {} entries from {}", entries.len(), input.display());

    let pages = generate_pdf(&config, &fonts, &entries, &output)?;

    println!("✓ Generated: {}", output.display());
    println!("  Layout: {} ({})", config.layout.key, config.layout.description);
    println!("  Badges: {}", entries.len());
    println!("  Pages: {}", pages);

    Ok(())
}

/// Input and output paths. clap already requires both unless --layout-list is
/// given, which returns before this point; the error keeps `run` panic free.
fn badge_paths(args: &Args) -> Result<(PathBuf, PathBuf), AppError> {
    let input = args.input.clone().ok_or(AppError::MissingArgument("input file"))?;
    let output = args.output.clone().ok_or(AppError::MissingArgument("output file"))?;
    Ok((input, output))
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// Layout Catalog
// ============================================================================

/// Known label sheets, each grid centred on its page
const LAYOUTS: &[SheetLayout] = &[
    SheetLayout {
        key: "4278",
        description: "HERMA Premium White Labels 70 x 50.8mm",
        page_width: A4_WIDTH_MM,
        page_height: A4_HEIGHT_MM,
        cell_width: 70.0,
        cell_height: 50.8,
        rows: 5,
        cols: 3,
        gap_x: 0.0,
        gap_y: 0.0,
        margin_x: 0.0,
        margin_y: 21.5,
    },
    SheetLayout {
        key: "4668",
        description: "HERMA Premium White Labels 70 x 42.3mm",
        page_width: A4_WIDTH_MM,
        page_height: A4_HEIGHT_MM,
        cell_width: 70.0,
        cell_height: 42.3,
        rows: 7,
        cols: 3,
        gap_x: 0.0,
        gap_y: 0.0,
        margin_x: 0.0,
        margin_y: 0.45,
    },
    SheetLayout {
        key: "1212",
        description: "APLI White Labels 70 x 37mm",
        page_width: A4_WIDTH_MM,
        page_height: A4_HEIGHT_MM,
        cell_width: 70.0,
        cell_height: 37.0,
        rows: 8,
        cols: 3,
        gap_x: 0.0,
        gap_y: 0.0,
        margin_x: 0.0,
        margin_y: 0.5,
    },
];

fn find_layout(key: &str) -> Result<&'static SheetLayout, AppError> {
    LAYOUTS
        .iter()
        .find(|layout| layout.key == key)
        .ok_or_else(|| AppError::UnknownLayout(key.to_string()))
}

fn print_layouts() {
    for layout in LAYOUTS {
        println!("{}  {}", layout.key, layout.description);
    }
}

// ============================================================================
// Participant Loading
// ============================================================================

impl RowRange {
    fn contains(&self, position: usize) -> bool {
        position >= self.first.unwrap_or(0) && self.last.map_or(true, |last| position <= last)
    }

    fn is_past(&self, position: usize) -> bool {
        self.last.is_some_and(|last| position > last)
    }
}

impl CsvRow {
    fn is_blank(&self) -> bool {
        [
            &self.kind,
            &self.email,
            &self.last_name,
            &self.first_name,
            &self.role,
            &self.company,
        ]
        .iter()
        .all(|field| field.is_empty())
    }

    fn into_entry(self, position: usize) -> Entry {
        Entry {
            kind: self.kind,
            email: self.email,
            last_name: self.last_name,
            first_name: self.first_name,
            role: self.role,
            company: self.company,
            position,
        }
    }
}

fn load_entries(path: &Path, range: RowRange, delimiter: u8) -> Result<Vec<Entry>, AppError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AppError::InputNotFound(path.display().to_string()),
        _ => AppError::IoError(e),
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let headers: csv::StringRecord = reader
        .headers()
        .map_err(|e| AppError::CsvError(e.to_string()))?
        .iter()
        .map(|header| header.trim_start_matches('\u{feff}'))
        .collect();

    if let Some(missing) = REQUIRED_COLUMNS
        .iter()
        .find(|column| !headers.iter().any(|header| header == **column))
    {
        return Err(AppError::MissingColumn(*missing));
    }

    let mut entries = Vec::new();
    let mut position = 0;
    for (index, record) in reader.records().enumerate() {
        let row = record
            .and_then(|mut record| {
                // Short records read their missing trailing fields as empty
                while record.len() < headers.len() {
                    record.push_field("");
                }
                record.deserialize::<CsvRow>(Some(&headers))
            });
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                warn!("Skipping unreadable record {}: {}", index + 1, e);
                continue;
            }
        };
        if row.is_blank() {
            continue;
        }

        if range.contains(position) {
            entries.push(row.into_entry(position));
        }
        position += 1;

        if range.is_past(position) {
            break;
        }
    }

    Ok(entries)
}

// ============================================================================
// Fonts and Text Fitting
// ============================================================================

enum FontSource {
    Builtin(BuiltinFont),
    TrueType(Vec<u8>),
}

/// A font together with the metrics needed to measure text, in 1/1000 em
struct FontFace {
    name: String,
    source: FontSource,
    advances: HashMap<char, f32>,
    default_advance: f32,
    ascent: f32,
    descent: f32,
}

impl FontFace {
    fn builtin(font: BuiltinFont, name: &str, widths: &[u16; 95]) -> Self {
        let advances = (b' '..=b'~')
            .zip(widths.iter())
            .map(|(c, width)| (char::from(c), f32::from(*width)))
            .collect();

        Self {
            name: name.to_string(),
            source: FontSource::Builtin(font),
            advances,
            default_advance: HELVETICA_DEFAULT_ADVANCE,
            ascent: HELVETICA_ASCENT,
            descent: HELVETICA_DESCENT,
        }
    }

    fn from_ttf(path: &Path) -> Result<Self, AppError> {
        let data = std::fs::read(path)
            .map_err(|e| AppError::FontError(format!("{}: {}", path.display(), e)))?;

        let face = ttf_parser::Face::parse(&data, 0)
            .map_err(|e| AppError::FontError(format!("{}: {}", path.display(), e)))?;

        let scale = 1000.0 / f32::from(face.units_per_em());
        let mut advances = HashMap::new();
        if let Some(cmap) = face.tables().cmap {
            for subtable in cmap.subtables {
                if !subtable.is_unicode() {
                    continue;
                }
                subtable.codepoints(|codepoint| {
                    let advance = char::from_u32(codepoint).and_then(|c| {
                        let glyph = face.glyph_index(c)?;
                        Some((c, face.glyph_hor_advance(glyph)?))
                    });
                    if let Some((c, advance)) = advance {
                        advances.insert(c, f32::from(advance) * scale);
                    }
                });
            }
        }

        // .notdef width stands in for characters the font lacks
        let default_advance = face
            .glyph_hor_advance(ttf_parser::GlyphId(0))
            .map_or(500.0, |advance| f32::from(advance) * scale);
        let ascent = f32::from(face.ascender()) * scale;
        let descent = f32::from(face.descender()) * scale;

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            name,
            source: FontSource::TrueType(data),
            advances,
            default_advance,
            ascent,
            descent,
        })
    }

    fn text_width_pt(&self, text: &str, size: f32) -> f32 {
        let units: f32 = text
            .chars()
            .map(|c| self.advances.get(&c).copied().unwrap_or(self.default_advance))
            .sum();
        units * size / 1000.0
    }

    /// Half the ascent-to-descent extent, used as the visual line height
    fn text_height_pt(&self, size: f32) -> f32 {
        (self.ascent - self.descent) / 2000.0 * size
    }

    fn add_to(&self, doc: &PdfDocumentReference) -> Result<IndirectFontRef, AppError> {
        let font = match &self.source {
            FontSource::Builtin(font) => doc.add_builtin_font(*font),
            FontSource::TrueType(data) => doc.add_external_font(data.as_slice()),
        };
        font.map_err(|e| AppError::PdfError(format!("font {}: {}", self.name, e)))
    }
}

/// The two faces used on a badge
struct FontRegistry {
    regular: FontFace,
    bold: FontFace,
}

/// Faces registered into one PDF document
struct DocumentFonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
}

impl FontRegistry {
    fn load(regular: Option<&Path>, bold: Option<&Path>) -> Result<Self, AppError> {
        let regular = match regular {
            Some(path) => FontFace::from_ttf(path)?,
            None => FontFace::builtin(BuiltinFont::Helvetica, "Helvetica", &HELVETICA_WIDTHS),
        };
        let bold = match bold {
            Some(path) => FontFace::from_ttf(path)?,
            None => FontFace::builtin(
                BuiltinFont::HelveticaBold,
                "Helvetica-Bold",
                &HELVETICA_BOLD_WIDTHS,
            ),
        };
        debug!("Using fonts {} / {}", regular.name, bold.name);
        Ok(Self { regular, bold })
    }

    fn register(&self, doc: &PdfDocumentReference) -> Result<DocumentFonts, AppError> {
        Ok(DocumentFonts {
            regular: self.regular.add_to(doc)?,
            bold: self.bold.add_to(doc)?,
        })
    }
}

/// Box a line of text must fit in, in mm
#[derive(Debug, Clone, Copy)]
struct Bounds {
    width: f32,
    height: f32,
}

/// Result of fitting a line: font size in points, measured extent in mm
#[derive(Debug, Clone, Copy, PartialEq)]
struct TextFit {
    size: f32,
    width: f32,
    height: f32,
}

impl TextFit {
    fn overflows(&self, bounds: Bounds) -> bool {
        self.width > bounds.width || self.height > bounds.height
    }
}

/// Largest size from `start_size` down, in `FIT_STEP_PT` steps, that keeps
/// `text` within `bounds`. Stops at `FIT_FLOOR_PT` even if it still overflows.
fn fit_text(face: &FontFace, text: &str, start_size: f32, bounds: Bounds) -> TextFit {
    let mut size = start_size.max(FIT_FLOOR_PT);
    loop {
        let fit = TextFit {
            size,
            width: face.text_width_pt(text, size) * PT_TO_MM,
            height: face.text_height_pt(size) * PT_TO_MM,
        };
        if !fit.overflows(bounds) || size - FIT_STEP_PT < FIT_FLOOR_PT {
            return fit;
        }
        size -= FIT_STEP_PT;
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NameBlock {
    /// "first last" on one line
    Single { text: String, fit: TextFit },
    /// First name above last name, both at `fit.size`
    Stacked { fit: TextFit },
}

fn fit_name(face: &FontFace, first: &str, last: &str, bounds: Bounds) -> NameBlock {
    let text = format!("{} {}", first, last).trim().to_string();
    let fit = fit_text(face, &text, NAME_FONT_SIZE, bounds);
    if fit.size >= NAME_MIN_SINGLE_LINE_PT {
        return NameBlock::Single { text, fit };
    }

    let first_fit = fit_text(face, first, NAME_FONT_SIZE, bounds);
    let last_fit = fit_text(face, last, NAME_FONT_SIZE, bounds);
    let fit = if first_fit.size <= last_fit.size {
        first_fit
    } else {
        last_fit
    };
    NameBlock::Stacked { fit }
}

// ============================================================================
// Placement
// ============================================================================

/// Grid slot for linear `index`: left to right, bottom row first, wrapping
/// to the next page every `rows * cols` slots.
fn place(layout: &SheetLayout, index: usize) -> Placement {
    let per_page = layout.per_page();
    let slot = index % per_page;
    let col = slot % layout.cols;
    let row = slot / layout.cols;

    let x = layout.margin_x + col as f32 * (layout.cell_width + layout.gap_x);
    let y = layout.margin_y + row as f32 * (layout.cell_height + layout.gap_y);

    Placement {
        page: index / per_page,
        row,
        col,
        rect: CellRect {
            x,
            y,
            width: layout.cell_width,
            height: layout.cell_height,
        },
    }
}

/// Placements for `count` entries starting at slot `start`, grouped by page.
/// Only the slot within a sheet matters, so `start` is taken modulo the page
/// size and pages are numbered from the first sheet. Always yields at least
/// one page.
fn plan_pages(layout: &SheetLayout, start: usize, count: usize) -> Vec<Vec<Placement>> {
    let start = start % layout.per_page();
    let mut pages: Vec<Vec<Placement>> = vec![Vec::new()];
    for index in start..start + count {
        let placement = place(layout, index);
        if placement.page == pages.len() {
            pages.push(Vec::new());
        }
        if let Some(page) = pages.last_mut() {
            page.push(placement);
        }
    }
    pages
}

// ============================================================================
// QR Code Generation
// ============================================================================

/// vCard 2.1 escapes only `;` and `\` inside structured values
fn escape_vcard_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' | ';' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\r' | '\n' => escaped.push(' '),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn make_vcard(entry: &Entry) -> String {
    [
        "BEGIN:VCARD".to_string(),
        "VERSION:2.1".to_string(),
        format!(
            "N:{};{}",
            escape_vcard_value(&entry.last_name),
            escape_vcard_value(&entry.first_name)
        ),
        format!("ORG:{}", escape_vcard_value(&entry.company)),
        format!("EMAIL:{}", escape_vcard_value(&entry.email)),
        "END:VCARD".to_string(),
    ]
    .join("\r\n")
}

fn generate_qr_image(entry: &Entry) -> Result<DynamicImage, AppError> {
    let vcard = make_vcard(entry);

    let code = QrCode::new(vcard.as_bytes())
        .map_err(|e| AppError::QrError(e.to_string()))?;

    let image = code.render::<Luma<u8>>().quiet_zone(false).build();
    Ok(DynamicImage::ImageLuma8(image))
}

fn embed_qr_code(
    layer: &PdfLayerReference,
    qr_image: &DynamicImage,
    x: f32,
    y: f32,
    size_mm: f32,
) {
    let rgb_image = qr_image.to_rgb8();
    let (width, height) = rgb_image.dimensions();

    let image = Image::from(ImageXObject {
        width: Px(width as usize),
        height: Px(height as usize),
        color_space: ColorSpace::Rgb,
        bits_per_component: ColorBits::Bit8,
        interpolate: false,
        image_data: rgb_image.into_raw(),
        image_filter: None,
        clipping_bbox: None,
        smask: None,
    });

    // DPI = pixels / (mm / 25.4)
    let dpi = (width as f32) / (size_mm / 25.4);

    image.add_to_layer(
        layer.clone(),
        ImageTransform {
            translate_x: Some(Mm(x)),
            translate_y: Some(Mm(y)),
            dpi: Some(dpi),
            ..Default::default()
        },
    );
}

// ============================================================================
// PDF Generation
// ============================================================================

/// Renders every entry and saves the document, returning the page count
fn generate_pdf(
    config: &BadgeConfig,
    fonts: &FontRegistry,
    entries: &[Entry],
    output_path: &Path,
) -> Result<usize, AppError> {
    let layout = config.layout;
    let (doc, page1, layer1) = PdfDocument::new(
        "Badges",
        Mm(layout.page_width),
        Mm(layout.page_height),
        "Layer 1",
    );
    let doc_fonts = fonts.register(&doc)?;

    let plan = plan_pages(layout, config.start, entries.len());
    let mut remaining = entries.iter();

    for (page_number, placements) in plan.iter().enumerate() {
        let layer = if page_number == 0 {
            doc.get_page(page1).get_layer(layer1)
        } else {
            let (page, layer) = doc.add_page(
                Mm(layout.page_width),
                Mm(layout.page_height),
                "Layer 1",
            );
            doc.get_page(page).get_layer(layer)
        };

        if config.debug {
            draw_debug_frame(
                &layer,
                CellRect {
                    x: 0.0,
                    y: 0.0,
                    width: layout.page_width,
                    height: layout.page_height,
                },
            );
        }

        for (placement, entry) in placements.iter().zip(&mut remaining) {
            debug!(
                "Generating badge for: {} {} (entry {}, page {}, row {}, col {})",
                entry.first_name,
                entry.last_name,
                entry.position,
                page_number + 1,
                placement.row,
                placement.col
            );
            draw_badge(&layer, fonts, &doc_fonts, placement.rect, entry, config.debug);
        }
    }

    let file = File::create(output_path)?;
    let mut writer = BufWriter::new(file);
    doc.save(&mut writer)
        .map_err(|e| AppError::PdfError(e.to_string()))?;

    info!("Saved {} pages to {}", plan.len(), output_path.display());
    Ok(plan.len())
}

// ============================================================================
// Badge Rendering
// ============================================================================

fn draw_badge(
    layer: &PdfLayerReference,
    fonts: &FontRegistry,
    doc_fonts: &DocumentFonts,
    cell: CellRect,
    entry: &Entry,
    debug: bool,
) {
    if debug {
        draw_debug_frame(layer, cell);
    }

    let area = cell.inset(CELL_PADDING_MM / 2.0);
    let height = area.height;
    let top = area.top();
    let qr_size = height * QR_SIZE_RATIO;
    let gap = height * LINE_GAP_RATIO;
    let text_width = area.width - qr_size;

    // Badge type
    if !entry.kind.is_empty() {
        let label = entry.kind.to_uppercase();
        let bounds = Bounds {
            width: text_width,
            height: height * TYPE_HEIGHT_RATIO,
        };
        let fit = fit_checked(&fonts.regular, &label, TYPE_FONT_SIZE, bounds);
        layer.use_text(
            label,
            fit.size,
            Mm(area.x),
            Mm(top - height * TYPE_BASELINE_RATIO - fit.height),
            &doc_fonts.regular,
        );
    }

    layer.set_outline_color(Color::Rgb(Rgb::new(0.0, 0.0, 0.0, None)));
    layer.set_outline_thickness(0.5);
    let divider_y = top - height * DIVIDER_RATIO;
    draw_line(
        layer,
        area.x,
        divider_y,
        area.x + DIVIDER_LENGTH_RATIO * text_width,
        divider_y,
    );

    // Name
    let name_bounds = Bounds {
        width: area.width,
        height: height * LINE_HEIGHT_RATIO,
    };
    let mut y_pos = match fit_name(&fonts.bold, &entry.first_name, &entry.last_name, name_bounds) {
        NameBlock::Single { text, fit } => {
            if fit.overflows(name_bounds) {
                warn!("Name '{}' overflows its badge at {}pt", text, fit.size);
            }
            let y = top - height * NAME_TOP_RATIO - gap - fit.height;
            layer.use_text(text, fit.size, Mm(area.x), Mm(y), &doc_fonts.bold);
            y
        }
        NameBlock::Stacked { fit } => {
            let first_y = top - height * STACKED_NAME_TOP_RATIO - gap - fit.height;
            layer.use_text(&entry.first_name, fit.size, Mm(area.x), Mm(first_y), &doc_fonts.bold);
            let last_y = first_y - fit.height - gap;
            layer.use_text(&entry.last_name, fit.size, Mm(area.x), Mm(last_y), &doc_fonts.bold);
            last_y
        }
    };

    // Role and organisation
    let detail_bounds = Bounds {
        width: text_width,
        height: height * LINE_HEIGHT_RATIO,
    };
    for line in [&entry.role, &entry.company] {
        if line.is_empty() {
            continue;
        }
        let fit = fit_checked(&fonts.regular, line, DETAIL_FONT_SIZE, detail_bounds);
        y_pos -= fit.height + gap;
        layer.use_text(line.as_str(), fit.size, Mm(area.x), Mm(y_pos), &doc_fonts.regular);
    }

    // Contact code, top-right. A row whose card cannot be encoded still gets its badge.
    match generate_qr_image(entry) {
        Ok(qr_image) => embed_qr_code(
            layer,
            &qr_image,
            area.x + area.width - qr_size + QR_BORDER_MM,
            top - qr_size + QR_BORDER_MM,
            qr_size - 2.0 * QR_BORDER_MM,
        ),
        Err(e) => warn!(
            "Drawing badge for entry {} without a contact code: {}",
            entry.position, e
        ),
    }
}

fn fit_checked(face: &FontFace, text: &str, start_size: f32, bounds: Bounds) -> TextFit {
    let fit = fit_text(face, text, start_size, bounds);
    if fit.overflows(bounds) {
        warn!("'{}' does not fit its box even at {}pt", text, fit.size);
    }
    fit
}

// ============================================================================
// Drawing Utilities
// ============================================================================

fn draw_line(layer: &PdfLayerReference, x1: f32, y1: f32, x2: f32, y2: f32) {
    let points = vec![
        (Point::new(Mm(x1), Mm(y1)), false),
        (Point::new(Mm(x2), Mm(y2)), false),
    ];
    let line = Line {
        points,
        is_closed: false,
    };
    layer.add_line(line);
}

/// Thin red outline used by --debug to check alignment against the sheet
fn draw_debug_frame(layer: &PdfLayerReference, rect: CellRect) {
    layer.set_outline_color(Color::Rgb(Rgb::new(1.0, 0.0, 0.0, None)));
    layer.set_outline_thickness(0.3);

    let points = vec![
        (Point::new(Mm(rect.x), Mm(rect.y)), false),
        (Point::new(Mm(rect.x + rect.width), Mm(rect.y)), false),
        (Point::new(Mm(rect.x + rect.width), Mm(rect.top())), false),
        (Point::new(Mm(rect.x), Mm(rect.top())), false),
    ];
    layer.add_line(Line {
        points,
        is_closed: true,
    });
}

// ============================================================================
// Tests
// ============================================================================
